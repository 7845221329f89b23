#![doc = include_str!("../README.md")]

pub mod chat;
pub mod decode;
pub mod encode;
mod impls;

pub mod game;

use std::io::Write;

pub use chat::ChatPacket;
pub use decode::FrameDecoder;
pub use encode::{encode_frame, FrameEncoder};
pub use game::GamePacket;

/// Number of bytes in the length prefix of every frame.
pub const FRAME_HEADER_LEN: usize = 2;

/// The largest frame payload the 2-byte length prefix can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// The protocol version sent in the `0x1600` chat handshake.
pub const CHAT_PROTOCOL_VERSION: u32 = 70;

/// The `Encode` trait allows objects to be written to either wire. It is the
/// inverse of [`Decode`].
///
/// All scalar fields are little-endian; strings are NUL-terminated. Fields
/// are encoded in the order they appear in the type definition.
pub trait Encode {
    /// Writes this object to the provided writer.
    ///
    /// If this type also implements [`Decode`] then successful calls to this
    /// function returning `Ok(())` must always successfully decode using the
    /// data that was written.
    fn encode(&self, w: impl Write) -> anyhow::Result<()>;
}

/// The `Decode` trait allows objects to be read from either wire. It is the
/// inverse of [`Encode`].
pub trait Decode: Sized {
    /// Reads this object from the front of `r`, advancing the slice past the
    /// bytes consumed.
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self>;
}

/// Decodes `T`, or yields `T::default()` when the input has already run dry.
///
/// Both wire formats drop optional tail fields rather than encoding empty
/// values, so decoders for those fields must treat EOF as zero/empty.
pub fn decode_or_default<T: Decode + Default>(r: &mut &[u8]) -> anyhow::Result<T> {
    if r.is_empty() {
        Ok(T::default())
    } else {
        T::decode(r)
    }
}

/// Defines the set of packets sharing one wire, and implements id-dispatched
/// encode/decode for the group.
macro_rules! packet_set {
    (
        $(#[$attrs:meta])*
        $enum_name:ident: $id_ty:ty {
            $($packet_id:literal = $packet:ident),* $(,)?
        }
    ) => {
        $(#[$attrs])*
        #[derive(Clone, PartialEq)]
        pub enum $enum_name {
            $(
                $packet($packet),
            )*
        }

        $(
            impl From<$packet> for $enum_name {
                fn from(p: $packet) -> Self {
                    Self::$packet(p)
                }
            }
        )*

        impl $enum_name {
            /// The wire id of the contained packet.
            pub fn packet_id(&self) -> $id_ty {
                match self {
                    $(
                        Self::$packet(_) => $packet_id,
                    )*
                }
            }

            /// The name of the contained packet, for diagnostics.
            pub fn packet_name(&self) -> &'static str {
                match self {
                    $(
                        Self::$packet(_) => stringify!($packet),
                    )*
                }
            }
        }

        impl crate::Encode for $enum_name {
            fn encode(&self, mut w: impl std::io::Write) -> anyhow::Result<()> {
                match self {
                    $(
                        Self::$packet(pkt) => {
                            let id: $id_ty = $packet_id;
                            crate::Encode::encode(&id, &mut w)?;
                            crate::Encode::encode(pkt, w)
                        }
                    )*
                }
            }
        }

        impl crate::Decode for $enum_name {
            fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
                let id = <$id_ty as crate::Decode>::decode(r)?;
                Ok(match id {
                    $(
                        $packet_id => Self::$packet(<$packet as crate::Decode>::decode(r)?),
                    )*
                    id => ::anyhow::bail!(
                        "unknown packet id {id:#06x} while decoding {}",
                        stringify!($enum_name)
                    ),
                })
            }
        }

        impl std::fmt::Debug for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(
                        Self::$packet(pkt) => pkt.fmt(f),
                    )*
                }
            }
        }
    };
}

pub(crate) use packet_set;
