use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("failed to allocate {bytes} bytes")]
    Allocation { bytes: usize },
    #[error("forward called before create_pipeline")]
    PipelineNotCreated,
    #[error("weight data has {actual} values, layer expects {expected}")]
    WeightSize { expected: usize, actual: usize },
    #[error("bias data has {actual} values, layer expects {expected}")]
    BiasSize { expected: usize, actual: usize },
    #[error("planar data has {actual} values, blob expects {expected}")]
    DataSize { expected: usize, actual: usize },
    #[error("padding ({horizontal} x {vertical}) leaves nothing of a {w}x{h} output")]
    BorderTooLarge {
        w: usize,
        h: usize,
        horizontal: usize,
        vertical: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
