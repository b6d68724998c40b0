//! Built-in validators and transformers.

mod allowed_types;
mod checksum;
mod magic_bytes;
mod signed_url;

pub use self::allowed_types::AllowedTypesValidator;
pub use self::checksum::{ChecksumTransformer, HashAlgorithm};
pub use self::magic_bytes::{MagicByteValidator, MagicSignature};
pub use self::signed_url::SignedUrlValidator;
