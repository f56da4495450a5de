use thiserror::Error;

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Every failure the bridge can report.
///
/// All variants except [`BridgeError::NativeLibraryError`] are raised while marshalling,
/// before the native library is called.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error("unsupported element type `{0}` (expected uint8 or float32)")]
    UnsupportedElementType(String),
    #[error("invalid stride: {stride} bytes is less than the row size of {min} bytes")]
    InvalidStride { stride: usize, min: usize },
    #[error("dimension mismatch: expected {expected_width}x{expected_height}, got {width}x{height}")]
    DimensionMismatch {
        expected_width: usize,
        expected_height: usize,
        width: usize,
        height: usize,
    },
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),
    #[error("null data pointer")]
    NullPointer,
    #[error("label {value} at ({x}, {y}) is outside [-1, {count})")]
    LabelOutOfRange {
        value: i32,
        x: usize,
        y: usize,
        count: u32,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("native library error {code}: {message}")]
    NativeLibraryError { code: i32, message: String },
    #[error("raster i/o: {0}")]
    Raster(String),
}

impl BridgeError {
    pub(crate) fn mismatch(expected: (usize, usize), actual: (usize, usize)) -> Self {
        BridgeError::DimensionMismatch {
            expected_width: expected.0,
            expected_height: expected.1,
            width: actual.0,
            height: actual.1,
        }
    }
}

impl From<image::ImageError> for BridgeError {
    fn from(err: image::ImageError) -> Self {
        BridgeError::Raster(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Raster(err.to_string())
    }
}
