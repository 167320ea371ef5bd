use mycel_identity::IdentityError;

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("append past the {limit} byte limit")]
    OutOfSpace { limit: usize },

    #[error("read past end of buffer at offset {position}")]
    Underflow { position: usize },

    #[error("length {len} does not fit the reserved {width} byte length field")]
    RfsOverflow { len: usize, width: usize },

    #[error("no length field reserved for patching")]
    RfsUnset,

    #[error("bad packet magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("unknown address code 0x{0:02x}")]
    UnknownAddressCode(u8),

    #[error("abbreviated address {0}* matches no cached subscriber")]
    UnresolvedAddress(String),

    #[error("address back-reference with no previous address in packet")]
    NoPreviousAddress,

    #[error("frame of {len} bytes overruns the packet")]
    TruncatedFrame { len: usize },

    #[error("all {0} interface slots in use")]
    TooManyInterfaces(usize),

    #[error("bad interface rule {0:?}")]
    BadRule(String),

    #[error("interface slot {0} is not up")]
    InterfaceDown(usize),

    #[error("queue {0} is full")]
    QueueFull(usize),

    #[error("identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
