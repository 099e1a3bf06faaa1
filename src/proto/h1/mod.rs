pub(crate) mod decode;
pub(crate) mod encode;
pub(crate) mod engine;
pub(crate) mod role;

pub(crate) use self::decode::Decoder;
pub(crate) use self::encode::Encoder;
pub(crate) use self::engine::{Engine, Event};
