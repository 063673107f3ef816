/* Copyright (C) 2022 by Jacob Alexander
 *
 * This file is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This file is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this file.  If not, see <http://www.gnu.org/licenses/>.
 */

// ----- Crates -----

use crate::dispatcher::Dispatcher;
use crate::error::CoreError;
use crate::registry::FeatureRegistry;
use hidpp_protocol::features::h1602::{self, STATUS_IN_PROGRESS, STATUS_SUCCESS};
use hidpp_protocol::features::h1e02::{self, BitMap};
use hidpp_protocol::HidppParseError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ----- Constants -----

/// Password block carried by Passwd0 / Passwd1
pub const PASSWORD_BLOCK_LEN: usize = 16;

// ----- Enumerations -----

/// Accounts of the authentication feature
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum AccountName {
    Manufacturing,
    Compliance,
    Gotthard,
}

impl AccountName {
    pub const ALL: [AccountName; 3] = [
        AccountName::Manufacturing,
        AccountName::Compliance,
        AccountName::Gotthard,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            AccountName::Manufacturing => "x1E02_Manuf",
            AccountName::Compliance => "x1E02_Compl",
            AccountName::Gotthard => "x1E02_Gothard",
        }
    }

    /// Account name as sent on the wire, zero padded
    pub fn padded(self) -> [u8; 16] {
        let mut name = [0u8; 16];
        let bytes = self.as_str().as_bytes();
        name[..bytes.len()].copy_from_slice(bytes);
        name
    }

    /// Deactivatable feature this account unlocks
    pub const fn feature_bit(self) -> u8 {
        match self {
            AccountName::Manufacturing => h1e02::MANUFACTURING,
            AccountName::Compliance => h1e02::COMPLIANCE,
            AccountName::Gotthard => h1e02::GOTHARD,
        }
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum SessionState {
    Idle,
    SessionOpened,
    AwaitingPasswd1,
    Authenticated,
}

// ----- Structs -----

/// Per account handshake state and the flags returned by StartSession
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Session {
    pub account: AccountName,
    pub state: SessionState,
    pub long_password: bool,
    pub full_authentication: bool,
    pub constant_credentials: bool,
}

impl Session {
    fn idle(account: AccountName) -> Session {
        Session {
            account,
            state: SessionState::Idle,
            long_password: false,
            full_authentication: false,
            constant_credentials: false,
        }
    }
}

/// Password authentication (0x1602) and deactivatable features (0x1E02) of one device
///
/// # Remarks
///
/// Handshakes are serialized per device. A device reset moves every
/// session back to Idle; replies of handshakes in flight at that moment
/// are discarded.
pub struct Authentication {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<FeatureRegistry>,
    timeout: Duration,
    sessions: Mutex<HashMap<AccountName, Session>>,
    /// Last known deactivatable feature state
    features: Mutex<h1e02::GetInfoResponse>,
    handshake: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
}

impl Authentication {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        registry: Arc<FeatureRegistry>,
        timeout: Duration,
    ) -> Authentication {
        Authentication {
            dispatcher,
            registry,
            timeout,
            sessions: Mutex::new(HashMap::new()),
            features: Mutex::new(h1e02::GetInfoResponse {
                support: BitMap::default(),
                persist: BitMap::default(),
                state: BitMap::default(),
            }),
            handshake: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    fn device_index(&self) -> u8 {
        self.registry.device_index()
    }

    /// Current state of an account
    pub fn session(&self, account: AccountName) -> Session {
        self.sessions
            .lock()
            .get(&account)
            .copied()
            .unwrap_or_else(|| Session::idle(account))
    }

    pub fn state(&self, account: AccountName) -> SessionState {
        self.session(account).state
    }

    /// Last deactivatable state read from (or written to) the device
    pub fn deactivatable(&self) -> h1e02::GetInfoResponse {
        *self.features.lock()
    }

    /// Applies `update` unless the device was reset since `epoch`
    fn commit(
        &self,
        epoch: u64,
        account: AccountName,
        update: impl FnOnce(&mut Session),
    ) -> Result<Session, CoreError> {
        let mut sessions = self.sessions.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            warn!("{} handshake interrupted by a device reset", account);
            return Err(CoreError::NotAuthenticated);
        }
        let session = sessions
            .entry(account)
            .or_insert_with(|| Session::idle(account));
        update(session);
        debug!("{} now {:?}", account, session.state);
        Ok(*session)
    }

    /// Opens a session for `account`
    ///
    /// An already opened session is returned as is, without wire traffic.
    /// An authenticated account is reopened.
    pub async fn start_session(&self, account: AccountName) -> Result<Session, CoreError> {
        let _handshake = self.handshake.lock().await;
        let current = self.session(account);
        match current.state {
            SessionState::SessionOpened | SessionState::AwaitingPasswd1 => return Ok(current),
            SessionState::Authenticated => info!("Reopening session of {}", account),
            SessionState::Idle => {}
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let index = self.registry.get_feature_index(h1602::FEATURE_ID).await?.feature_index;
        let response: h1602::StartSessionResponse = self
            .dispatcher
            .request(
                self.device_index(),
                index,
                &h1602::StartSession {
                    account_name: account.padded(),
                },
                self.timeout,
            )
            .await?;

        self.commit(epoch, account, |session| {
            session.state = SessionState::SessionOpened;
            session.long_password = response.long_password;
            session.full_authentication = response.full_authentication;
            session.constant_credentials = response.constant_credentials;
        })
    }

    /// Closes the session of `account`
    pub async fn end_session(&self, account: AccountName) -> Result<(), CoreError> {
        let _handshake = self.handshake.lock().await;
        let epoch = self.epoch.load(Ordering::SeqCst);
        let index = self.registry.get_feature_index(h1602::FEATURE_ID).await?.feature_index;
        let _: h1602::EndSessionResponse = self
            .dispatcher
            .request(
                self.device_index(),
                index,
                &h1602::EndSession {
                    account_name: account.padded(),
                },
                self.timeout,
            )
            .await?;
        self.commit(epoch, account, |session| *session = Session::idle(account))?;
        Ok(())
    }

    /// Maps a password status byte to the next state
    fn status_transition(
        &self,
        epoch: u64,
        account: AccountName,
        status: u8,
        in_progress_allowed: bool,
    ) -> Result<SessionState, CoreError> {
        let next = match status {
            STATUS_SUCCESS => SessionState::Authenticated,
            STATUS_IN_PROGRESS if in_progress_allowed => SessionState::AwaitingPasswd1,
            _ => {
                warn!("{} authentication failed, status {:#04x}", account, status);
                self.commit(epoch, account, |session| *session = Session::idle(account))?;
                return Err(CoreError::AuthFailed);
            }
        };
        self.commit(epoch, account, |session| session.state = next)?;
        Ok(next)
    }

    /// Sends the first password block, the session must be opened
    pub async fn passwd0(
        &self,
        account: AccountName,
        block: [u8; PASSWORD_BLOCK_LEN],
    ) -> Result<SessionState, CoreError> {
        let _handshake = self.handshake.lock().await;
        self.passwd0_locked(account, block).await
    }

    async fn passwd0_locked(
        &self,
        account: AccountName,
        block: [u8; PASSWORD_BLOCK_LEN],
    ) -> Result<SessionState, CoreError> {
        if self.state(account) != SessionState::SessionOpened {
            return Err(CoreError::WrongSequence);
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let index = self.registry.get_feature_index(h1602::FEATURE_ID).await?.feature_index;
        let response: h1602::Passwd0Response = self
            .dispatcher
            .request(
                self.device_index(),
                index,
                &h1602::Passwd0 { passwd: block },
                self.timeout,
            )
            .await?;
        self.status_transition(epoch, account, response.status, true)
    }

    /// Sends the second password block, only after an in progress Passwd0
    pub async fn passwd1(
        &self,
        account: AccountName,
        block: [u8; PASSWORD_BLOCK_LEN],
    ) -> Result<SessionState, CoreError> {
        let _handshake = self.handshake.lock().await;
        self.passwd1_locked(account, block).await
    }

    async fn passwd1_locked(
        &self,
        account: AccountName,
        block: [u8; PASSWORD_BLOCK_LEN],
    ) -> Result<SessionState, CoreError> {
        if self.state(account) != SessionState::AwaitingPasswd1 {
            return Err(CoreError::WrongSequence);
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let index = self.registry.get_feature_index(h1602::FEATURE_ID).await?.feature_index;
        let response: h1602::Passwd1Response = self
            .dispatcher
            .request(
                self.device_index(),
                index,
                &h1602::Passwd1 { passwd: block },
                self.timeout,
            )
            .await?;
        self.status_transition(epoch, account, response.status, false)
    }

    /// Sends a whole password on an opened session
    ///
    /// # Remarks
    /// 16 bytes for short password accounts, 32 for long ones. A length not
    /// matching the session flags is rejected before anything is sent.
    pub async fn authenticate(
        &self,
        account: AccountName,
        password: &[u8],
    ) -> Result<SessionState, CoreError> {
        let _handshake = self.handshake.lock().await;
        let session = self.session(account);
        if session.state != SessionState::SessionOpened {
            return Err(CoreError::WrongSequence);
        }

        let expected = if session.long_password {
            2 * PASSWORD_BLOCK_LEN
        } else {
            PASSWORD_BLOCK_LEN
        };
        if password.len() != expected {
            return Err(HidppParseError::InvalidField {
                field: "password",
                value: password.len() as u64,
            }
            .into());
        }

        let mut block = [0u8; PASSWORD_BLOCK_LEN];
        block.copy_from_slice(&password[..PASSWORD_BLOCK_LEN]);
        let state = self.passwd0_locked(account, block).await?;
        if state != SessionState::AwaitingPasswd1 {
            return Ok(state);
        }
        if !session.long_password {
            // Short password accounts complete on the first block
            self.commit(self.epoch.load(Ordering::SeqCst), account, |session| {
                *session = Session::idle(account)
            })?;
            return Err(CoreError::AuthFailed);
        }

        block.copy_from_slice(&password[PASSWORD_BLOCK_LEN..]);
        self.passwd1_locked(account, block).await
    }

    /// Accounts that must be authenticated to enable `bit_map`
    fn required_accounts(bit_map: BitMap) -> Vec<AccountName> {
        let bits = u8::from(bit_map);
        AccountName::ALL
            .into_iter()
            .filter(|account| bit_map.all || bits & account.feature_bit() != 0)
            .collect()
    }

    /// Enables deactivatable features
    ///
    /// Each requested feature needs its account to be authenticated.
    /// Returns the state read back from the device.
    pub async fn enable_features(
        &self,
        bit_map: BitMap,
    ) -> Result<h1e02::GetInfoResponse, CoreError> {
        for account in Self::required_accounts(bit_map) {
            if self.state(account) != SessionState::Authenticated {
                warn!("Enabling {:?} needs an authenticated {}", bit_map, account);
                return Err(CoreError::NotAuthenticated);
            }
        }

        let index = self.registry.get_feature_index(h1e02::FEATURE_ID).await?.feature_index;
        let _: h1e02::EnableFeaturesResponse = self
            .dispatcher
            .request(
                self.device_index(),
                index,
                &h1e02::EnableFeatures { bit_map },
                self.timeout,
            )
            .await?;
        self.get_info().await
    }

    /// Disables deactivatable features, no authentication needed
    pub async fn disable_features(
        &self,
        bit_map: BitMap,
    ) -> Result<h1e02::GetInfoResponse, CoreError> {
        let index = self.registry.get_feature_index(h1e02::FEATURE_ID).await?.feature_index;
        let _: h1e02::DisableFeaturesResponse = self
            .dispatcher
            .request(
                self.device_index(),
                index,
                &h1e02::DisableFeatures { bit_map },
                self.timeout,
            )
            .await?;
        self.get_info().await
    }

    /// Reads supported, persistent and current deactivatable features
    pub async fn get_info(&self) -> Result<h1e02::GetInfoResponse, CoreError> {
        let index = self.registry.get_feature_index(h1e02::FEATURE_ID).await?.feature_index;
        let info: h1e02::GetInfoResponse = self
            .dispatcher
            .request(self.device_index(), index, &h1e02::GetInfo, self.timeout)
            .await?;
        *self.features.lock() = info;
        Ok(info)
    }

    /// Feature id of the authentication feature used to re-enable features
    pub async fn get_react_info(&self) -> Result<u16, CoreError> {
        let index = self.registry.get_feature_index(h1e02::FEATURE_ID).await?.feature_index;
        let response: h1e02::GetReactInfoResponse = self
            .dispatcher
            .request(self.device_index(), index, &h1e02::GetReactInfo, self.timeout)
            .await?;
        Ok(response.auth_feature)
    }

    /// Device reset: sessions go Idle, manufacturing and compliance are cleared
    pub fn device_reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().clear();
        let mut features = self.features.lock();
        features.state.manufacturing = false;
        features.state.compliance = false;
        features.state.all = false;
        info!(
            "Device {:02x} sessions reset, gotthard {}",
            self.device_index(),
            if features.state.gothard { "kept" } else { "off" }
        );
    }
}

// ----- Tests -----
