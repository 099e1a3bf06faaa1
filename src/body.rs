//! Request bodies.
//!
//! A [`Body`] is one of a small set of accepted shapes: nothing, a
//! contiguous byte buffer, a seekable reader streamed in blocks, or a lazy
//! sequence of byte chunks. Text is deliberately *not* an accepted shape:
//! callers must pick an encoding and hand over bytes. The `String`
//! conversions exist so that mistake surfaces as a clear
//! `InvalidBodyError` before any wire activity instead of a confusing
//! compile error deep in generic code.

use std::fmt;
use std::io::{Read, Seek, SeekFrom};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::proto::BodyLength;

/// How many bytes to pull from a reader body per chunk.
const READ_BLOCK_SIZE: usize = 8192;

/// A request body.
pub struct Body {
    kind: Kind,
}

enum Kind {
    Empty,
    Full {
        bytes: Bytes,
        consumed: bool,
    },
    /// Rejected at send time; see the module docs.
    Text(String),
    Reader {
        reader: Box<dyn ReadSeekSend>,
        /// Position recorded before the first read, for replay. `None`
        /// after a failed record means the body cannot be rewound.
        start: Option<u64>,
        started: bool,
    },
    Chunks {
        iter: Box<dyn Iterator<Item = Bytes> + Send>,
        started: bool,
    },
}

pub(crate) trait ReadSeekSend: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeekSend for T {}

impl Body {
    /// An absent body. No framing headers are emitted for it.
    pub fn empty() -> Body {
        Body { kind: Kind::Empty }
    }

    /// A body streamed from a seekable reader.
    ///
    /// The reader is pulled in 8 KiB blocks and framed chunked. Its
    /// position is recorded before the first read so the body can be
    /// replayed across a 307/308 redirect.
    pub fn reader<R>(reader: R) -> Body
    where
        R: Read + Seek + Send + 'static,
    {
        Body {
            kind: Kind::Reader {
                reader: Box::new(reader),
                start: None,
                started: false,
            },
        }
    }

    /// A body made of a lazy sequence of byte chunks, framed chunked.
    ///
    /// Zero-length chunks are legal and are silently dropped by the
    /// framing layer. A partially consumed chunk sequence cannot be
    /// replayed.
    pub fn chunks<I>(chunks: I) -> Body
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        Body {
            kind: Kind::Chunks {
                iter: Box::new(chunks.into_iter()),
                started: false,
            },
        }
    }

    /// Rejects shapes that can never go on the wire.
    ///
    /// Runs before any pool or socket activity.
    pub(crate) fn validate(&self) -> Result<()> {
        match self.kind {
            Kind::Text(_) => Err(Error::new_invalid_body(
                "text bodies are not accepted: encode to bytes first",
            )),
            _ => Ok(()),
        }
    }

    /// The framing hint handed to the protocol engine. `None` means no
    /// body at all.
    pub(crate) fn length(&self) -> Option<BodyLength> {
        match self.kind {
            Kind::Empty => None,
            Kind::Full { ref bytes, .. } => Some(BodyLength::Known(bytes.len() as u64)),
            Kind::Text(_) => None,
            Kind::Reader { .. } => Some(BodyLength::Unknown),
            Kind::Chunks { .. } => Some(BodyLength::Unknown),
        }
    }

    /// Pulls the next chunk, or `None` once the body is exhausted.
    pub(crate) fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.kind {
            Kind::Empty | Kind::Text(_) => Ok(None),
            Kind::Full {
                ref bytes,
                ref mut consumed,
            } => {
                if *consumed || bytes.is_empty() {
                    Ok(None)
                } else {
                    *consumed = true;
                    Ok(Some(bytes.clone()))
                }
            }
            Kind::Reader {
                ref mut reader,
                ref mut start,
                ref mut started,
            } => {
                if !*started {
                    *started = true;
                    // a reader that cannot tell us where it is cannot be
                    // rewound later
                    *start = reader.stream_position().ok();
                }
                let mut block = vec![0; READ_BLOCK_SIZE];
                let n = reader
                    .read(&mut block)
                    .map_err(|e| Error::new_invalid_body("failed to read request body").with(e))?;
                if n == 0 {
                    Ok(None)
                } else {
                    block.truncate(n);
                    Ok(Some(Bytes::from(block)))
                }
            }
            Kind::Chunks {
                ref mut iter,
                ref mut started,
            } => {
                *started = true;
                Ok(iter.next())
            }
        }
    }

    /// Restores the body to its pre-send position so it can be replayed.
    ///
    /// Buffers always rewind. Readers seek back to the position recorded
    /// before the first read; if that position could not be recorded or
    /// the seek fails, this is an `UnrewindableBodyError`. A chunk
    /// sequence that has started draining cannot be replayed.
    pub(crate) fn rewind(&mut self) -> Result<()> {
        match self.kind {
            Kind::Empty | Kind::Text(_) => Ok(()),
            Kind::Full {
                ref mut consumed, ..
            } => {
                *consumed = false;
                Ok(())
            }
            Kind::Reader {
                ref mut reader,
                ref start,
                ref mut started,
            } => {
                if !*started {
                    return Ok(());
                }
                let start = start.ok_or_else(Error::new_unrewindable_body)?;
                reader
                    .seek(SeekFrom::Start(start))
                    .map_err(|e| Error::new_unrewindable_body().with(e))?;
                *started = false;
                Ok(())
            }
            Kind::Chunks { ref started, .. } => {
                if *started {
                    Err(Error::new_unrewindable_body())
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body {
            kind: Kind::Full {
                bytes,
                consumed: false,
            },
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body::from(Bytes::from(vec))
    }
}

impl From<&'static [u8]> for Body {
    fn from(slice: &'static [u8]) -> Body {
        Body::from(Bytes::from_static(slice))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Body {
        Body {
            kind: Kind::Text(text),
        }
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Body {
        Body::from(text.to_owned())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.kind {
            Kind::Empty => "Empty",
            Kind::Full { .. } => "Full",
            Kind::Text(_) => "Text",
            Kind::Reader { .. } => "Reader",
            Kind::Chunks { .. } => "Chunks",
        };
        f.debug_tuple("Body").field(&name).finish()
    }
}
