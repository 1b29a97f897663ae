//! # Audio Module
//!
//! Per-guild playback queues for one bot identity.
//!
//! ## Architecture
//!
//! ### [`queue`] - Track Collection
//! - Entries keyed by an opaque [`track::EntryKey`] with a monotonic index
//! - Ordered, random and filtered lookups; requeue for queue looping
//!
//! ### [`player`] - Queue State Machine
//! - `Idle → Playing ⇄ Paused → Destroyed` per guild
//! - Loop modes, shuffle, volume, filters and the skip guard
//! - Playback generations so stale end/error events are ignored
//!
//! ### [`manager`] - Queue Manager
//! - Owns every active [`player::RoomQueue`] of the identity
//! - Joins voice, drains player signals, runs the idle timer and
//!   persists snapshots after every state change
//!
//! ### [`effects`] - Audio Filters
//! - ffmpeg filter chains and the perceptual volume curve
//!
//! ## Audio Quality
//!
//! - **Sample Rate**: 48kHz (Discord standard)
//! - **Channels**: Stereo (2 channels)
//! - **Transcode**: ffmpeg to `f32le`, Opus encoding by songbird

pub mod effects;
pub mod manager;
pub mod player;
pub mod queue;
pub mod track;
