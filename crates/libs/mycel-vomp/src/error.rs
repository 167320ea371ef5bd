#[derive(Debug, thiserror::Error)]
pub enum VompError {
    #[error("malformed frame: {0}")]
    Parse(String),

    #[error("unsupported frame kind 0x{0:02x}")]
    UnsupportedFrame(u8),

    #[error("all {0} call slots in use")]
    TooManyCalls(usize),

    #[error("no such call")]
    NoSuchCall,

    #[error("call is not in a state where that is possible")]
    WrongState,

    #[error("no matching call and the frame does not open one")]
    NotACallOpening,
}
