//! Mutable token container handed in by callers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::types::{Token, TokenIdentity, TokenService};

/// A caller-owned set of delegation tokens, keyed by [`TokenIdentity`].
///
/// Adding a token for an identity that is already present replaces the old
/// one, so the container never holds two tokens for the same service
/// identity.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    tokens: BTreeMap<TokenIdentity, Token>,
}

impl Credentials {
    /// Creates an empty credentials container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token, returning the token it replaced, if any.
    pub fn add_token(&mut self, token: Token) -> Option<Token> {
        self.tokens.insert(token.identity(), token)
    }

    /// Removes the token for `identity`.
    pub fn remove_token(&mut self, identity: &TokenIdentity) -> Option<Token> {
        self.tokens.remove(identity)
    }

    /// Returns the token for `identity`.
    #[must_use]
    pub fn token(&self, identity: &TokenIdentity) -> Option<&Token> {
        self.tokens.get(identity)
    }

    /// Returns a live token for `service`, regardless of kind.
    #[must_use]
    pub fn live_token_for_service(
        &self,
        service: &TokenService,
        now: DateTime<Utc>,
    ) -> Option<&Token> {
        self.tokens.values().find(|token| &token.service == service && token.is_live(now))
    }

    /// Returns `true` if a token for `identity` is present and live at `now`.
    #[must_use]
    pub fn has_live_token(&self, identity: &TokenIdentity, now: DateTime<Utc>) -> bool {
        self.tokens.get(identity).is_some_and(|token| token.is_live(now))
    }

    /// Returns the number of tokens held.
    #[must_use]
    pub fn number_of_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Iterates over all held tokens in identity order.
    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values()
    }
}
