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

//! Poll supervisor: one ticker-driven thread per periodic query

use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::publisher::Publisher;
use crate::slot::ConnectorSlot;
use chrono::{DateTime, Utc};
use crossbeam_channel::{tick, Receiver};
use log::{info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

type QueryFn = Box<dyn Fn(&mut dyn Connector, &Publisher, DateTime<Utc>) -> Result<()> + Send>;

/// A periodic query: acquires its transport on each tick, runs one
/// request/response turn and hands the result to the publisher.
pub struct Query {
    name: &'static str,
    interval: Duration,
    slot: Arc<ConnectorSlot>,
    run: QueryFn,
}

impl Query {
    pub fn new<F>(name: &'static str, interval: Duration, slot: Arc<ConnectorSlot>, run: F) -> Query
    where
        F: Fn(&mut dyn Connector, &Publisher, DateTime<Utc>) -> Result<()> + Send + 'static,
    {
        Query {
            name,
            interval,
            slot,
            run: Box::new(run),
        }
    }
}

/// Spawn every query on its own thread. The threads stop as soon as the
/// shutdown channel closes, releasing the transport first.
pub fn spawn_queries(
    queries: Vec<Query>,
    publisher: Arc<Publisher>,
    shutdown: Receiver<()>,
) -> Vec<JoinHandle<()>> {
    queries
        .into_iter()
        .map(|query| spawn_query(query, Arc::clone(&publisher), shutdown.clone()))
        .collect()
}

fn spawn_query(query: Query, publisher: Arc<Publisher>, shutdown: Receiver<()>) -> JoinHandle<()> {
    thread::spawn(move || {
        // The ticker holds at most one pending tick, so polls missed while
        // a turn is still in flight coalesce instead of queueing up.
        let ticker = tick(query.interval);
        loop {
            crossbeam_channel::select! {
                recv(ticker) -> _ => {
                    let mut guard = match query.slot.acquire(&shutdown) {
                        Ok(guard) => guard,
                        // Only cancellation surfaces from acquire
                        Err(_) => break,
                    };
                    let now = Utc::now();
                    match (query.run)(&mut *guard, &publisher, now) {
                        Ok(()) => {}
                        Err(Error::Cancelled) => break,
                        // A failed turn skips this tick; peers keep polling
                        Err(e) => warn!("{}: {}", query.name, e),
                    }
                }
                recv(shutdown) -> _ => break,
            }
        }
        info!("{}: poller stopped", query.name);
    })
}
