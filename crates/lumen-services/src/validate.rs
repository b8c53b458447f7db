//! Response validation.
//!
//! A validator looks at the request that was sent and the raw payload that
//! came back, and either accepts it (yielding the bytes handed to the
//! caller) or says why it is unusable. Rejections never reach the caller;
//! they lower the peer's score and trigger a retry elsewhere.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use lumen_core::{content_hash, Hash, Header, Receipt, Request, RequestKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept(Bytes),
    Reject(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    /// Could not be decoded at all.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Decoded, but is not what was asked for.
    #[error("response does not match the request")]
    WrongData,
}

pub trait Validator: Send + Sync + 'static {
    fn validate(&self, request: &Request, payload: &[u8]) -> Verdict;
}

impl<F> Validator for F
where
    F: Fn(&Request, &[u8]) -> Verdict + Send + Sync + 'static,
{
    fn validate(&self, request: &Request, payload: &[u8]) -> Verdict {
        self(request, payload)
    }
}

/// Validators keyed by request kind.
#[derive(Clone, Default)]
pub struct ValidatorSet {
    by_kind: HashMap<RequestKind, Arc<dyn Validator>>,
}

impl ValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content-hash checks for trie nodes and code, decoding checks for
    /// headers and receipts.
    pub fn with_defaults() -> Self {
        let mut set = Self::new();
        set.register(RequestKind::TrieNode, hash_validator);
        set.register(RequestKind::Code, hash_validator);
        set.register(RequestKind::Header, header_validator);
        set.register(RequestKind::Receipts, ReceiptsValidator::unchecked());
        set
    }

    /// Install `validator` for `kind`, replacing any previous one.
    pub fn register<V: Validator>(&mut self, kind: RequestKind, validator: V) -> &mut Self {
        self.by_kind.insert(kind, Arc::new(validator));
        self
    }

    pub fn get(&self, kind: RequestKind) -> Option<Arc<dyn Validator>> {
        self.by_kind.get(&kind).cloned()
    }

    pub fn contains(&self, kind: RequestKind) -> bool {
        self.by_kind.contains_key(&kind)
    }
}

impl fmt::Debug for ValidatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.by_kind.keys()).finish()
    }
}

// ── Default validators ───────────────────────────────────────────────────────

/// Accepts the payload iff its content hash is the requested one.
pub fn hash_validator(request: &Request, payload: &[u8]) -> Verdict {
    let expected = match request {
        Request::TrieNode { node_hash, .. } => node_hash,
        Request::Code { code_hash } => code_hash,
        other => {
            return Verdict::Reject(RejectReason::Malformed(format!(
                "no content hash for {:?} request",
                other.kind()
            )))
        }
    };
    if content_hash(payload) == *expected {
        Verdict::Accept(Bytes::copy_from_slice(payload))
    } else {
        Verdict::Reject(RejectReason::WrongData)
    }
}

/// Decodes a header and checks it is the one at the requested number.
pub fn header_validator(request: &Request, payload: &[u8]) -> Verdict {
    let Request::Header { number } = request else {
        return Verdict::Reject(RejectReason::Malformed("not a header request".into()));
    };
    match serde_json::from_slice::<Header>(payload) {
        Ok(header) if header.number == *number => Verdict::Accept(Bytes::copy_from_slice(payload)),
        Ok(_) => Verdict::Reject(RejectReason::WrongData),
        Err(e) => Verdict::Reject(RejectReason::Malformed(e.to_string())),
    }
}

type RootLookup = Arc<dyn Fn(u64, &Hash) -> Option<Hash> + Send + Sync>;

/// Decodes a receipt list. With a root lookup, the payload hash must also
/// equal the root the local chain expects for that block.
#[derive(Clone)]
pub struct ReceiptsValidator {
    root: Option<RootLookup>,
}

impl ReceiptsValidator {
    pub fn unchecked() -> Self {
        Self { root: None }
    }

    pub fn with_root_lookup<F>(lookup: F) -> Self
    where
        F: Fn(u64, &Hash) -> Option<Hash> + Send + Sync + 'static,
    {
        Self {
            root: Some(Arc::new(lookup)),
        }
    }
}

impl Validator for ReceiptsValidator {
    fn validate(&self, request: &Request, payload: &[u8]) -> Verdict {
        let Request::Receipts {
            block_number,
            block_hash,
        } = request
        else {
            return Verdict::Reject(RejectReason::Malformed("not a receipts request".into()));
        };
        if let Err(e) = serde_json::from_slice::<Vec<Receipt>>(payload) {
            return Verdict::Reject(RejectReason::Malformed(e.to_string()));
        }
        if let Some(lookup) = &self.root {
            match lookup(*block_number, block_hash) {
                Some(root) if root != content_hash(payload) => {
                    return Verdict::Reject(RejectReason::WrongData)
                }
                _ => {}
            }
        }
        Verdict::Accept(Bytes::copy_from_slice(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_must_hash_to_request() {
        let code = b"push1 0x00";
        let request = Request::Code {
            code_hash: content_hash(code),
        };
        let set = ValidatorSet::with_defaults();
        let v = set.get(RequestKind::Code).unwrap();
        assert_eq!(
            v.validate(&request, code),
            Verdict::Accept(Bytes::from_static(code))
        );
        assert_eq!(
            v.validate(&request, b"push1 0x01"),
            Verdict::Reject(RejectReason::WrongData)
        );
    }

    #[test]
    fn header_number_is_checked() {
        let header = Header {
            number: 42,
            ..Header::default()
        };
        let payload = header.encode();
        assert!(matches!(
            header_validator(&Request::Header { number: 42 }, &payload),
            Verdict::Accept(_)
        ));
        assert_eq!(
            header_validator(&Request::Header { number: 43 }, &payload),
            Verdict::Reject(RejectReason::WrongData)
        );
        assert!(matches!(
            header_validator(&Request::Header { number: 42 }, b"\x00garbage"),
            Verdict::Reject(RejectReason::Malformed(_))
        ));
    }

    #[test]
    fn receipts_root_lookup() {
        let receipts = vec![Receipt {
            tx_hash: [7; 32],
            success: true,
            gas_used: 21_000,
        }];
        let payload = serde_json::to_vec(&receipts).unwrap();
        let root = content_hash(&payload);
        let request = Request::Receipts {
            block_number: 9,
            block_hash: [9; 32],
        };

        let checked = ReceiptsValidator::with_root_lookup(move |n, _| (n == 9).then_some(root));
        assert!(matches!(checked.validate(&request, &payload), Verdict::Accept(_)));
        assert_eq!(
            checked.validate(&request, b"[]"),
            Verdict::Reject(RejectReason::WrongData)
        );
        assert!(matches!(
            ReceiptsValidator::unchecked().validate(&request, b"[]"),
            Verdict::Accept(_)
        ));
    }

    #[test]
    fn closures_are_validators() {
        let mut set = ValidatorSet::new();
        assert!(!set.contains(RequestKind::Code));
        set.register(RequestKind::Code, |_: &Request, _: &[u8]| {
            Verdict::Reject(RejectReason::WrongData)
        });
        let v = set.get(RequestKind::Code).unwrap();
        assert_eq!(
            v.validate(&Request::Code { code_hash: [0; 32] }, b""),
            Verdict::Reject(RejectReason::WrongData)
        );
    }
}
