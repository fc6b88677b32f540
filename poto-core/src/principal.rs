//! Principals and the capability interface used to look them up.

use async_trait::async_trait;
use dashmap::DashMap;

/// Role tag carried by transient principals created on anonymous login.
pub const VISITOR_ROLE: &str = "visitor";

/// The authenticated identity performing a request.
///
/// Immutable after creation; the dispatcher shares one `Arc<Principal>`
/// across everything descended from a request.
#[derive(Debug, Clone)]
pub struct Principal {
    id: String,
    credential_hash: Option<String>,
    roles: Vec<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            credential_hash: None,
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_credential(
        id: impl Into<String>,
        credential_hash: impl Into<String>,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            credential_hash: Some(credential_hash.into()),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// A transient visitor principal.
    pub fn visitor(id: impl Into<String>, credential_hash: impl Into<String>) -> Self {
        Self::with_credential(id, credential_hash, [VISITOR_ROLE])
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn credential_hash(&self) -> Option<&str> {
        self.credential_hash.as_deref()
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_visitor(&self) -> bool {
        self.has_role(VISITOR_ROLE)
    }
}

/// Capability interface the core consumes for principal lookup and
/// registration. `add_principal` MUST be atomic: under concurrent calls
/// with the same identifier exactly one caller observes `true`.
#[async_trait]
pub trait PrincipalStore: Send + Sync + 'static {
    async fn find_principal(&self, user_id: &str) -> Option<Principal>;

    /// Insert a new principal. Returns `true` if it was newly inserted.
    async fn add_principal(&self, principal: Principal) -> bool;
}

/// In-memory principal store for tests and demos.
#[derive(Default)]
pub struct MemoryPrincipalStore {
    principals: DashMap<String, Principal>,
}

impl MemoryPrincipalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.principals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }
}

#[async_trait]
impl PrincipalStore for MemoryPrincipalStore {
    async fn find_principal(&self, user_id: &str) -> Option<Principal> {
        self.principals.get(user_id).map(|p| p.clone())
    }

    async fn add_principal(&self, principal: Principal) -> bool {
        match self.principals.entry(principal.id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(principal);
                true
            }
        }
    }
}
