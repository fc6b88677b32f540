/// Errors produced while encoding or decoding a typed envelope.
#[derive(Debug)]
pub enum CodecError {
    /// The value graph (or envelope) nests deeper than the configured ceiling.
    Depth { max: usize },

    /// A string, buffer, or blob exceeds its configured ceiling.
    SizeLimit {
        what: &'static str,
        actual: usize,
        max: usize,
    },

    /// The value contains a blob, which the synchronous encoder refuses.
    NeedsAsync,

    /// A tagged object has the wrong shape for its tag.
    MalformedTag(String),

    /// A base-64 payload could not be decoded.
    BadBase64(String),

    /// An object carries a single `__`-prefixed key outside the tag vocabulary.
    UnknownTag(String),

    /// The envelope is not valid JSON.
    Json(String),

    /// A blob byte source failed while being read.
    BlobRead(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Depth { max } => {
                write!(f, "Value nests deeper than the configured limit of {max}")
            }
            CodecError::SizeLimit { what, actual, max } => {
                write!(f, "{what} of {actual} bytes exceeds the limit of {max}")
            }
            CodecError::NeedsAsync => {
                write!(f, "Blob values require the asynchronous encoder")
            }
            CodecError::MalformedTag(msg) => write!(f, "Malformed tag: {msg}"),
            CodecError::BadBase64(msg) => write!(f, "Invalid base64 payload: {msg}"),
            CodecError::UnknownTag(tag) => write!(f, "Unknown tag: {tag}"),
            CodecError::Json(msg) => write!(f, "Invalid JSON envelope: {msg}"),
            CodecError::BlobRead(msg) => write!(f, "Blob read failed: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}
