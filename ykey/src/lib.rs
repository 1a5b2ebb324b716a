#![warn(unused_extern_crates)]

//! # ykey
//!
//! Application sessions for YubiKey devices. Each session drives one
//! on-device application over a connection supplied by the embedder;
//! the connection traits and wire framing live in `ykey-transport`,
//! CTAP2 message plumbing in `ykey-ctap`, and shared primitives in
//! `ykey-core`.
//!
//! ## Architecture
//!
//! - **Management**: device info, enabling and disabling applications
//!   per transport
//! - **PIV**: smart-card key slots for signing, decryption and key
//!   agreement
//! - **OpenPGP**: the OpenPGP card application
//! - **YubiOTP**: the legacy OTP slots (Yubico OTP, HMAC-SHA1
//!   challenge-response, static passwords)
//! - **WebAuthn**: a CTAP2 WebAuthn client with PIN/UV handling
//!
//! ## Example
//!
//! ```no_run
//! # fn run(connection: impl ykey_transport::SmartCardConnection) -> ykey_core::Result<()> {
//! let mut session = ykey::ManagementSession::from_smart_card(connection)?;
//! let info = session.read_device_info()?;
//! println!("firmware {}, serial {:?}", info.version, info.serial);
//! # Ok(())
//! # }
//! ```

pub mod management;
pub mod openpgp;
pub mod piv;
pub mod webauthn;
pub mod yubiotp;

// Re-export the session types at root level for convenience
pub use management::{DeviceConfig, DeviceInfo, ManagementSession};
pub use openpgp::OpenPgpSession;
pub use piv::PivSession;
pub use webauthn::WebAuthnClient;
pub use yubiotp::YubiOtpSession;
