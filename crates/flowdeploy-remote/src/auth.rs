use async_trait::async_trait;

use flowdeploy_types::{FlowDeployError, Result};

/// Credentials of one acting user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub jwt: String,
    pub user_id: String,
}

impl Token {
    pub fn new(jwt: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            jwt: jwt.into(),
            user_id: user_id.into(),
        }
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        if self
            .jwt
            .get(..7)
            .is_some_and(|p| p.eq_ignore_ascii_case("bearer "))
        {
            self.jwt.clone()
        } else {
            format!("Bearer {}", self.jwt)
        }
    }
}

/// Exchanges a user id for credentials usable against remote services.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, user_id: &str) -> Result<Token>;
}

/// Hands out one configured bearer token for every user.
#[derive(Debug, Clone)]
pub struct StaticTokenExchange {
    jwt: String,
}

impl StaticTokenExchange {
    pub fn new(jwt: impl Into<String>) -> Self {
        Self { jwt: jwt.into() }
    }
}

#[async_trait]
impl TokenExchange for StaticTokenExchange {
    async fn exchange(&self, user_id: &str) -> Result<Token> {
        if user_id.is_empty() {
            return Err(FlowDeployError::Other(
                "cannot exchange a token for an empty user id".into(),
            ));
        }
        Ok(Token::new(self.jwt.clone(), user_id))
    }
}
