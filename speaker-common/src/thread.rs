// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker threads that are told to stop through a shared flag and joined when
//! their owner lets go of them.

use crate::lock;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{Builder, JoinHandle},
};

/// A named thread paired with its stop flag. Dropping a `StoppableThread`
/// raises the flag and blocks until the thread has exited, so a dropped handle
/// never leaves a thread behind.
///
/// The thread body is responsible for polling the flag it is handed.
#[derive(Debug)]
pub struct StoppableThread {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StoppableThread {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = Builder::new().name(name.clone()).spawn(move || body(flag))?;
        Ok(Self {
            name,
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raise the stop flag without waiting.
    pub fn signal(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        match lock!(self.handle).as_ref() {
            Some(h) => h.is_finished(),
            None => true,
        }
    }

    /// Raise the stop flag and wait for the thread to exit. Subsequent calls
    /// return immediately.
    pub fn stop(&self) {
        self.signal();
        let handle = lock!(self.handle).take();
        if let Some(handle) = handle {
            // A panicking worker has already torn itself down.
            let _ = handle.join();
        }
    }
}

impl Drop for StoppableThread {
    fn drop(&mut self) {
        self.stop();
    }
}
