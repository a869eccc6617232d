use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("IO Error")]
    IoError(#[from] std::io::Error),
    #[error("Unable to read {1} bytes at address {0:#x}")]
    ReadPtrError(usize, usize),
    #[error("Unable to write {1} bytes at address {0:#x}")]
    WritePtrError(usize, usize),
    #[error("Unable to change protection of {1} bytes at address {0:#x}: {2}")]
    ProtectError(usize, usize, String),
    #[error("Could not create pattern `{0}`")]
    PatternError(String),
    #[error("No occurence for given pattern has been found for `{0}`")]
    PatternNotFound(String),
    #[error("Patch `{0}` has no pattern selected")]
    NotConfigured(String),
    #[error("Jump from {0:#x} to {1:#x} does not fit a 32-bit displacement")]
    JumpOutOfRange(usize, usize),
    #[error("Version tier {0} is not above the previous tier {1}")]
    UnorderedTier(u32, u32),
}

impl From<hex::FromHexError> for PatchError {
    fn from(error: hex::FromHexError) -> PatchError {
        PatchError::PatternError(format!("{}", error))
    }
}
