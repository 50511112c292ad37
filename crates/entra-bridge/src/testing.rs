//! In-process broker double for dispatcher and session tests.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::bridge::protocol::{Account, AccountList, BrokerState, CookieResult};
use crate::broker::{Broker, BrokerError, StateNotifier};

pub(crate) struct FakeBroker {
    online: bool,
    notifier: StateNotifier,
    sso_urls: Arc<StdMutex<Vec<Option<String>>>>,
    /// State published while handling `getAccounts`, to simulate a transition racing a
    /// response.
    flip_on_accounts: Option<BrokerState>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            online: true,
            notifier: StateNotifier::new(),
            sso_urls: Arc::default(),
            flip_on_accounts: None,
        }
    }

    /// Broker that is absent: probes offline, cookie requests fail.
    pub fn offline() -> Self {
        Self {
            online: false,
            ..Self::new()
        }
    }

    pub fn flipping_to(mut self, state: BrokerState) -> Self {
        self.flip_on_accounts = Some(state);
        self
    }

    pub fn sso_urls(&self) -> Arc<StdMutex<Vec<Option<String>>>> {
        Arc::clone(&self.sso_urls)
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn get_accounts(&self) -> Result<AccountList, BrokerError> {
        if let Some(state) = self.flip_on_accounts {
            self.notifier.record(state);
        }
        Ok(AccountList {
            accounts: vec![Account {
                name: "Windows User".to_string(),
                username: "windows_user".to_string(),
            }],
        })
    }

    async fn acquire_prt_sso_cookie(
        &self,
        _account: &Account,
        sso_url: Option<&str>,
        _scopes: &[String],
    ) -> Result<CookieResult, BrokerError> {
        self.sso_urls
            .lock()
            .unwrap()
            .push(sso_url.map(str::to_string));
        if !self.online {
            return Err(BrokerError::NoCookies);
        }
        Ok(CookieResult {
            cookie_name: "x-ms-RefreshTokenCredential".to_string(),
            cookie_content: "prt".to_string(),
        })
    }

    async fn acquire_token_silently(
        &self,
        _account: &Account,
        _scopes: &[String],
    ) -> Result<Value, BrokerError> {
        Ok(json!({"error": "not implemented"}))
    }

    async fn probe(&self) -> BrokerState {
        let state = BrokerState::from_online(self.online);
        self.notifier.record(state);
        state
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<BrokerState> {
        self.notifier.subscribe()
    }
}
