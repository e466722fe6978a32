//! `mushkeep`: a transparent TCP proxy that keeps MUD/MUSH sessions alive
//! across backend restarts.
//!
//! Clients connect to mushkeep instead of the game server. When the game
//! server dies, client connections stay open; a dedicated heartbeat
//! connection probes for the server's return, and once it is back each
//! session silently reopens its backend socket and replays the user's
//! `connect` credentials, gagging backend output until the reconnect
//! sentinel comes through.

pub mod config;
pub mod engine;
pub mod heartbeat;
pub mod introspect;
pub mod pending;
pub mod protocol;
pub mod session;
