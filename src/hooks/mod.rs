//! Hooks Module
//!
//! Authentication, authorization and event callbacks consulted by the
//! engine. Every method has a permissive default, so an implementation only
//! overrides what it needs.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{Publish, QoS};


#[derive(Debug)]
pub enum HookError {
    /// Hook could not reach a decision
    Internal(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}

pub type HookResult<T> = Result<T, HookError>;

/// Operation being authorized on a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Publish { qos: QoS, retain: bool },
    Subscribe { qos: QoS },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

/// Outcome of a CONNECT authentication check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accept,
    /// CONNACK 0x86
    BadCredentials,
    /// CONNACK 0x87
    NotAuthorized,
}

/// Identity of the client an operation belongs to
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
}

#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called before a session is created or resumed
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<AuthOutcome> {
        Ok(AuthOutcome::Accept)
    }

    /// Called for every inbound PUBLISH and every SUBSCRIBE filter.
    /// Will messages are published by the server and are not checked.
    async fn authorize(
        &self,
        _client: ClientInfo<'_>,
        _topic: &str,
        _action: Action,
    ) -> HookResult<Decision> {
        Ok(Decision::Allow)
    }

    /// Called after the CONNACK has been queued
    async fn on_client_connected(&self, _client_id: &str, _session_present: bool) {}

    /// `graceful` is false when the will was eligible for publication
    async fn on_client_disconnected(&self, _client_id: &str, _graceful: bool) {}

    /// Called after a publish has been fanned out to `delivered` sessions
    async fn on_message_published(&self, _publish: &Publish, _delivered: usize) {}
}

/// Allows everything
#[derive(Debug, Default)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

#[async_trait]
impl<T: Hooks + ?Sized> Hooks for Arc<T> {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<AuthOutcome> {
        (**self)
            .on_authenticate(client_id, username, password)
            .await
    }

    async fn authorize(
        &self,
        client: ClientInfo<'_>,
        topic: &str,
        action: Action,
    ) -> HookResult<Decision> {
        (**self).authorize(client, topic, action).await
    }

    async fn on_client_connected(&self, client_id: &str, session_present: bool) {
        (**self)
            .on_client_connected(client_id, session_present)
            .await;
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        (**self).on_client_disconnected(client_id, graceful).await;
    }

    async fn on_message_published(&self, publish: &Publish, delivered: usize) {
        (**self).on_message_published(publish, delivered).await;
    }
}

/// Chains hook implementations.
///
/// Checks stop at the first refusal; events reach every hook in order.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<AuthOutcome> {
        for hooks in &self.hooks {
            let outcome = hooks.on_authenticate(client_id, username, password).await?;
            if outcome != AuthOutcome::Accept {
                return Ok(outcome);
            }
        }
        Ok(AuthOutcome::Accept)
    }

    async fn authorize(
        &self,
        client: ClientInfo<'_>,
        topic: &str,
        action: Action,
    ) -> HookResult<Decision> {
        for hooks in &self.hooks {
            if !hooks.authorize(client, topic, action).await?.is_allowed() {
                return Ok(Decision::Deny);
            }
        }
        Ok(Decision::Allow)
    }

    async fn on_client_connected(&self, client_id: &str, session_present: bool) {
        for hooks in &self.hooks {
            hooks.on_client_connected(client_id, session_present).await;
        }
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(client_id, graceful).await;
        }
    }

    async fn on_message_published(&self, publish: &Publish, delivered: usize) {
        for hooks in &self.hooks {
            hooks.on_message_published(publish, delivered).await;
        }
    }
}
