//! Token issuance seam.
//!
//! The responder owns token issuance: serial numbers, sequence tracking and
//! revocation are its policy. Key exchange and the responder request flow
//! only reach issuance through [`TokenFactory`].

use msl_crypto::{CryptoContext, SessionKeys};

use crate::{
    auth::MslUser,
    env::Environment,
    error::MslError,
    tokens::{MasterToken, UserIdToken},
};

/// Issues, renews and checks tokens on the responder.
pub trait TokenFactory: Send + Sync {
    /// Context that signs and encrypts tokens issued by this factory.
    fn issuer_context(&self) -> &dyn CryptoContext;

    /// Issue a master token with a fresh serial number.
    fn create_master_token(
        &self,
        env: &dyn Environment,
        identity: &str,
        keys: &SessionKeys,
    ) -> Result<MasterToken, MslError>;

    /// Renew `master_token` under new session keys.
    ///
    /// The renewed token keeps the serial number and takes the next sequence
    /// number after the newest one issued for that serial.
    ///
    /// # Errors
    ///
    /// - `EntityAuth` if the token is revoked or unknown
    fn renew_master_token(
        &self,
        env: &dyn Environment,
        master_token: &MasterToken,
        keys: &SessionKeys,
    ) -> Result<MasterToken, MslError>;

    /// Check that `master_token` is still acceptable.
    ///
    /// # Errors
    ///
    /// - `EntityAuth` if the serial number is revoked or was never issued
    /// - `KeyExchange` if the sequence number is too far behind the newest
    fn check_master_token(&self, env: &dyn Environment, master_token: &MasterToken) -> Result<(), MslError>;

    /// Issue a user id token for `user` bound to `master_token`.
    fn create_user_id_token(
        &self,
        env: &dyn Environment,
        user: &MslUser,
        master_token: &MasterToken,
    ) -> Result<UserIdToken, MslError>;

    /// Renew `user_id_token`, binding it to `master_token`.
    ///
    /// # Errors
    ///
    /// - `UserAuth` if the user id token cannot be decrypted
    fn renew_user_id_token(
        &self,
        env: &dyn Environment,
        user_id_token: &UserIdToken,
        master_token: &MasterToken,
    ) -> Result<UserIdToken, MslError>;
}
