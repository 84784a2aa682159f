//! The channel pool. Picks a channel for each accepted conn according to the
//! configured allocation policy.

use crate::channel::Channel;
use rivet_rpc_core::AllocPolicy;
use rivet_rpc_core::error::Error;
use rivet_stream::{ServerConfig, StreamConn};
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Soft cap per channel; beyond it the pool spills to the least loaded one.
const CONN_QUOTA: usize = 256;

/// Index choice, split out from the pool so the policies are testable
/// without standing up pollers.
fn pick(counts: &[usize], policy: AllocPolicy) -> usize {
    debug_assert!(!counts.is_empty());
    match policy {
        AllocPolicy::PackHighest => {
            // Fullest channel still under quota, to keep poller threads warm.
            let mut best: Option<usize> = None;
            for (i, &c) in counts.iter().enumerate() {
                if c >= CONN_QUOTA {
                    continue;
                }
                match best {
                    Some(b) if counts[b] >= c => {}
                    _ => best = Some(i),
                }
            }
            match best {
                Some(i) => i,
                // Everyone is at quota: fall back to least loaded.
                None => pick(counts, AllocPolicy::SpreadLowest),
            }
        }
        AllocPolicy::SpreadLowest => {
            let mut best = 0;
            for (i, &c) in counts.iter().enumerate().skip(1) {
                if c < counts[best] {
                    best = i;
                }
            }
            best
        }
    }
}

pub struct ChannelManager {
    channels: Vec<Channel>,
    policy: AllocPolicy,
}

impl ChannelManager {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, Error> {
        let n = config.channel_count();
        let mut channels = Vec::with_capacity(n);
        for id in 0..n {
            channels.push(Channel::new(id, config.clone())?);
        }
        info!("channel manager: {} channels, policy {:?}", n, config.alloc_policy);
        Ok(Self { channels, policy: config.alloc_policy })
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn total_active(&self) -> usize {
        self.channels.iter().map(Channel::active).sum()
    }

    /// Route an accepted fd onto a channel per the allocation policy.
    pub fn add_conn(&self, fd_owner: OwnedFd, stream: Arc<StreamConn>) -> Result<(), Error> {
        let counts: Vec<usize> = self.channels.iter().map(Channel::active).collect();
        let idx = pick(&counts, self.policy);
        self.channels[idx].add_conn(fd_owner, stream)
    }

    /// Close every channel, concurrently. The first error wins, but all
    /// channels are closed regardless.
    pub fn close(&self) -> Result<(), Error> {
        let mut first_err = None;
        std::thread::scope(|scope| {
            let handles: Vec<_> =
                self.channels.iter().map(|ch| scope.spawn(move || ch.close())).collect();
            for h in handles {
                if let Ok(Err(e)) = h.join() {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        });
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
