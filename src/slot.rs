//
// Copyright (C) 2022 CUAVA, The University of Sydney
//
// Licensed under the Apache License, Version 2.0 (the "License")
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Exclusive transport ownership: a one-slot channel holding the connector

use crate::connector::Connector;
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::ops::{Deref, DerefMut};

/// Holds a connector in a one-slot channel. Acquiring takes the connector
/// out of the slot for a full request/response turn; the guard puts it back
/// on drop. Contending callers block in arrival order.
pub struct ConnectorSlot {
    tx: Sender<Box<dyn Connector>>,
    rx: Receiver<Box<dyn Connector>>,
}

impl ConnectorSlot {
    pub fn new(conn: Box<dyn Connector>) -> ConnectorSlot {
        let (tx, rx) = bounded(1);
        let slot = ConnectorSlot { tx, rx };
        // The slot is empty and both ends are held, so this cannot fail
        let _ = slot.tx.send(conn);
        slot
    }

    /// Take the connector, blocking until it is free. Returns
    /// [`Error::Cancelled`] as soon as the shutdown channel closes.
    pub fn acquire(&self, cancel: &Receiver<()>) -> Result<ConnectorGuard> {
        crossbeam_channel::select! {
            recv(self.rx) -> conn => match conn {
                Ok(conn) => Ok(ConnectorGuard { conn: Some(conn), slot: self.tx.clone() }),
                Err(_) => Err(Error::Cancelled),
            },
            recv(cancel) -> _ => Err(Error::Cancelled),
        }
    }

    /// Take the connector without a cancellation path. Used during teardown
    /// to reclaim and close the transport once all pollers have stopped.
    pub fn acquire_blocking(&self) -> Result<ConnectorGuard> {
        match self.rx.recv() {
            Ok(conn) => Ok(ConnectorGuard {
                conn: Some(conn),
                slot: self.tx.clone(),
            }),
            Err(_) => Err(Error::Cancelled),
        }
    }
}

/// Owning token for a connector taken from a [`ConnectorSlot`]. The
/// connector goes back to the slot when the guard drops, on every exit path.
pub struct ConnectorGuard {
    conn: Option<Box<dyn Connector>>,
    slot: Sender<Box<dyn Connector>>,
}

impl Deref for ConnectorGuard {
    type Target = dyn Connector;

    fn deref(&self) -> &(dyn Connector + 'static) {
        // Present from construction until drop
        self.conn.as_deref().expect("connector taken")
    }
}

impl DerefMut for ConnectorGuard {
    fn deref_mut(&mut self) -> &mut (dyn Connector + 'static) {
        self.conn.as_deref_mut().expect("connector taken")
    }
}

impl Drop for ConnectorGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // A disconnected slot means the daemon is tearing down; dropping
            // the connector closes the underlying handle.
            let _ = self.slot.send(conn);
        }
    }
}
