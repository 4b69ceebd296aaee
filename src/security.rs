// The user attached to a connection by whatever authenticated the HTTP upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub authenticated: bool,
}

// Security context of one connection
#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    user: Option<Identity>,
}

impl SecurityContext {
    pub fn anonymous() -> Self {
        SecurityContext { user: None }
    }

    pub fn authenticated(name: impl Into<String>) -> Self {
        SecurityContext {
            user: Some(Identity {
                name: name.into(),
                authenticated: true,
            }),
        }
    }

    pub fn with_user(user: Identity) -> Self {
        SecurityContext { user: Some(user) }
    }

    pub fn default_user(&self) -> Option<&Identity> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.as_ref().is_some_and(|u| u.authenticated)
    }
}
