use std::fmt;

/// An API credential handed out by the quota tracker
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Stable identifier used for quota bookkeeping and logs
    pub id: String,

    /// Bearer token sent with each request
    pub token: String,
}

impl Credential {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
        }
    }
}

// Tokens never reach log output
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .finish()
    }
}
