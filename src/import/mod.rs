//! Foreign-CLI credential importers.
//!
//! Each submodule discovers a peer CLI's on-disk credentials and adapts
//! them for the broker: Gemini CLI and the Antigravity IDE keep flat or
//! nested JSON files, Amazon Q keeps a SQLite database (reached through
//! WSL on Windows).

pub mod amazonq;
pub mod antigravity;
pub mod gemini;
pub mod peer_creds;

pub use peer_creds::PeerOAuthCreds;
