//! Opaque identifiers. Ownership is the store's; everything else refers to
//! entities by id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum IdError {
    #[error("identifier cannot be blank")]
    Blank,
}

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh identifier from process entropy.
            pub fn generate() -> Self {
                let mut s = String::with_capacity(32);
                for _ in 0..4 {
                    s.push_str(&format!("{:08x}", fastrand::u32(..)));
                }
                Self(s)
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(IdError::Blank);
                }
                Ok(Self(s.to_owned()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

opaque_id! {
    /// A logical document; owns exactly one repository.
    DocumentId
}
opaque_id! {
    /// A proposal branched off a document's mainline.
    ProposalId
}
opaque_id! {
    /// A deliberation thread anchored to a document node.
    ThreadId
}
opaque_id! {
    /// A reply within a thread.
    AnnotationId
}
opaque_id! {
    /// A participant. Actors are store-backed; no key material is attached.
    ActorId
}
opaque_id! {
    /// A space grouping documents into a tree.
    SpaceId
}
opaque_id! {
    /// A reviewable change within a proposal.
    ChangeId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique_enough() {
        let a = DocumentId::generate();
        let b = DocumentId::generate();
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_blank_rejected() {
        assert!(ThreadId::from_str("  ").is_err());
        assert!(ThreadId::from_str("t-1").is_ok());
    }
}
