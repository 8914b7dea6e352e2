//! Thin wrapper around [`tokio::sync::RwLock`] that turns the "can't happen"
//! lock-poisoning case into a [`MumbleError`] instead of a panic, so call
//! sites can propagate with `?` the same way they do for I/O errors.
//!
//! `tokio::sync::RwLock` doesn't actually poison on panic the way
//! `std::sync::RwLock` does, but keeping the fallible interface means a
//! future switch to a poisoning lock (or a mock used in tests) doesn't
//! change any call sites.

use crate::error::MumbleError;

pub struct RwLock<T>(tokio::sync::RwLock<T>);

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        Self(tokio::sync::RwLock::new(value))
    }
}

#[async_trait::async_trait]
pub trait RwLockExt<T: Send + Sync> {
    async fn read_err(&self) -> Result<tokio::sync::RwLockReadGuard<'_, T>, MumbleError>;
    async fn write_err(&self) -> Result<tokio::sync::RwLockWriteGuard<'_, T>, MumbleError>;
}

#[async_trait::async_trait]
impl<T: Send + Sync> RwLockExt<T> for RwLock<T> {
    async fn read_err(&self) -> Result<tokio::sync::RwLockReadGuard<'_, T>, MumbleError> {
        Ok(self.0.read().await)
    }

    async fn write_err(&self) -> Result<tokio::sync::RwLockWriteGuard<'_, T>, MumbleError> {
        Ok(self.0.write().await)
    }
}
