pub mod signature;

pub use signature::{
    extract_signature, sign_payload, signature_header_value, verify_signature, SIGNATURE_HEADERS,
    SIGNATURE_PREFIX,
};
