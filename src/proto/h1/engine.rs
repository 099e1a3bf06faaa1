use bytes::{Bytes, BytesMut};
use http::header::CONNECTION;
use http::{HeaderMap, Method, StatusCode, Version};

use super::decode::{Decode, Decoder};
use super::encode::Encoder;
use super::role;
use crate::error::{Error, Parse, Result};
use crate::proto::{BodyLength, RequestHead, ResponseHead};

/// Hard cap on a buffered-but-unparsed response head.
const MAX_HEAD_SIZE: usize = 8192 + 4096 * role::DEFAULT_MAX_HEADERS;

/// A sans-I/O HTTP/1.1 client state machine.
///
/// The engine tracks one exchange at a time across two half-states: what we
/// are sending and what the peer is sending back. Callers push outgoing
/// events in (`send_request`, `send_data`, `send_eom`) and get wire bytes
/// back, and feed received bytes in (`receive_data`) and pull parse events
/// out (`next_event`). It never touches a socket, so the same machine backs
/// every transport.
///
/// After both sides reach end-of-message, [`Engine::start_next_cycle`]
/// returns the machine to idle iff the finished exchange was keep-alive
/// eligible; otherwise the connection must be discarded.
#[derive(Debug)]
pub(crate) struct Engine {
    our_state: Ours,
    their_state: Theirs,
    read_buf: BytesMut,
    saw_eof: bool,
    /// The request method steers response body framing (HEAD, CONNECT).
    method: Option<Method>,
    keep_alive: bool,
}

#[derive(Debug)]
enum Ours {
    Idle,
    Body(Encoder),
    Done,
    /// A send was aborted partway; the peer's view of our framing is
    /// unknowable, so the connection must never be reused.
    Failed,
}

#[derive(Debug)]
enum Theirs {
    Idle,
    Head,
    Body(Decoder),
    Done,
}

/// One parse event from the receive side of the engine.
#[derive(Debug)]
pub(crate) enum Event {
    /// More received bytes are required before anything can happen.
    NeedData,
    /// A 1xx response; consumed and discarded by the caller.
    Informational(ResponseHead),
    /// The final response head.
    Response(ResponseHead),
    /// A chunk of response body.
    Data(Bytes),
    /// The response body is complete.
    EndOfMessage,
    /// The peer closed a connection that owed us nothing.
    ConnectionClosed,
}

impl Engine {
    pub(crate) fn new() -> Engine {
        Engine {
            our_state: Ours::Idle,
            their_state: Theirs::Idle,
            read_buf: BytesMut::with_capacity(8192),
            saw_eof: false,
            method: None,
            keep_alive: true,
        }
    }

    /// Both halves are idle and a new exchange may begin.
    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.our_state, Ours::Idle) && matches!(self.their_state, Theirs::Idle)
    }

    /// Serializes a request head, transitioning both halves out of idle.
    ///
    /// `body` communicates how much body will follow so the engine can pick
    /// framing; `None` means no body at all.
    pub(crate) fn send_request(
        &mut self,
        head: &RequestHead,
        body: Option<BodyLength>,
    ) -> Result<Bytes> {
        if !self.is_idle() {
            return Err(Error::new_state());
        }

        let mut dst = Vec::new();
        let encoder = role::encode_request(head, body, &mut dst)?;

        if connection_has(&head.headers, "close") {
            self.keep_alive = false;
        }
        self.method = Some(head.method.clone());
        self.our_state = Ours::Body(encoder);
        self.their_state = Theirs::Head;
        Ok(dst.into())
    }

    /// Frames one body chunk. Empty chunks produce no wire bytes.
    pub(crate) fn send_data(&mut self, chunk: &[u8]) -> Result<Bytes> {
        match self.our_state {
            Ours::Body(ref mut encoder) => encoder.encode(chunk),
            _ => Err(Error::new_state()),
        }
    }

    /// Frames the end of the request body.
    pub(crate) fn send_eom(&mut self) -> Result<Bytes> {
        match self.our_state {
            Ours::Body(ref encoder) => {
                let bytes = encoder.end()?;
                self.our_state = Ours::Done;
                Ok(bytes)
            }
            _ => Err(Error::new_state()),
        }
    }

    /// Poisons the send half after an aborted write.
    ///
    /// The engine may believe a full request went out when the transport
    /// only delivered part of it, so reuse must be refused.
    pub(crate) fn send_failed(&mut self) {
        trace!("send_failed; connection will not be reused");
        self.our_state = Ours::Failed;
    }

    /// Feeds received bytes into the parse buffer. An empty slice records
    /// end-of-file.
    pub(crate) fn receive_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            trace!("receive_data saw EOF");
            self.saw_eof = true;
        } else {
            self.read_buf.extend_from_slice(data);
        }
    }

    /// Pulls the next parse event out of the buffered bytes.
    pub(crate) fn next_event(&mut self) -> Result<Event> {
        match self.their_state {
            Theirs::Idle => {
                if !self.read_buf.is_empty() {
                    Err(Error::new_unexpected_message())
                } else if self.saw_eof {
                    Ok(Event::ConnectionClosed)
                } else {
                    Ok(Event::NeedData)
                }
            }
            Theirs::Head => match role::parse_response(&mut self.read_buf)? {
                Some(head) => {
                    if head.status.is_informational() {
                        if head.status == StatusCode::SWITCHING_PROTOCOLS {
                            debug!("received 101 upgrade response, not supported");
                            return Err(Error::new_unexpected_message());
                        }
                        trace!("ignoring informational response: {}", head.status);
                        return Ok(Event::Informational(head));
                    }

                    let decoder = role::response_decoder(&head, self.method.as_ref())?;
                    if decoder.is_close_delimited() {
                        // a read-till-close body consumes the connection
                        self.keep_alive = false;
                    }
                    if !response_keep_alive(head.version, &head.headers) {
                        self.keep_alive = false;
                    }
                    self.their_state = Theirs::Body(decoder);
                    Ok(Event::Response(head))
                }
                None => {
                    if self.saw_eof {
                        Err(Error::new_incomplete())
                    } else if self.read_buf.len() > MAX_HEAD_SIZE {
                        Err(Error::new_parse(Parse::TooLarge))
                    } else {
                        Ok(Event::NeedData)
                    }
                }
            },
            Theirs::Body(ref mut decoder) => {
                match decoder.decode(&mut self.read_buf, self.saw_eof)? {
                    Decode::Data(data) => Ok(Event::Data(data)),
                    Decode::NeedData => Ok(Event::NeedData),
                    Decode::End => {
                        self.their_state = Theirs::Done;
                        Ok(Event::EndOfMessage)
                    }
                }
            }
            Theirs::Done => {
                if self.saw_eof {
                    Ok(Event::ConnectionClosed)
                } else {
                    Ok(Event::NeedData)
                }
            }
        }
    }

    /// Returns the engine to idle/idle for the next exchange on the same
    /// connection.
    ///
    /// Fails unless both sides finished cleanly and the exchange was
    /// keep-alive eligible; the caller must then close the connection.
    pub(crate) fn start_next_cycle(&mut self) -> Result<()> {
        let clean = matches!(self.our_state, Ours::Done) && matches!(self.their_state, Theirs::Done);
        if !clean || !self.keep_alive || self.saw_eof || !self.read_buf.is_empty() {
            trace!(
                "start_next_cycle refused; ours={:?} theirs={:?} keep_alive={} eof={}",
                self.our_state,
                self.their_state,
                self.keep_alive,
                self.saw_eof,
            );
            return Err(Error::new_state());
        }
        self.our_state = Ours::Idle;
        self.their_state = Theirs::Idle;
        self.method = None;
        self.keep_alive = true;
        Ok(())
    }
}

/// Whether the response's version and `Connection` header allow reuse.
fn response_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if version == Version::HTTP_11 {
        !connection_has(headers, "close")
    } else if version == Version::HTTP_10 {
        connection_has(headers, "keep-alive")
    } else {
        false
    }
}

fn connection_has(headers: &HeaderMap, option: &str) -> bool {
    for value in headers.get_all(CONNECTION) {
        if let Ok(value) = value.to_str() {
            if value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case(option))
            {
                return true;
            }
        }
    }
    false
}
