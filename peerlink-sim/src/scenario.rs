//! Loopback run: one server, N clients, every configured payload echoed back by the server.

use std::collections::VecDeque;
use std::fmt;

use anyhow::{bail, ensure};
use peerlink_core::{
    ConnectionHandle, Delivery, LoopbackChannel, NetworkEvent, PeerId, Transport,
    TransportSettings, SERVER_HANDLE,
};
use rand::RngCore;
use tracing::{debug, info};

use crate::config::Config;

/// Totals for one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    /// Echoes verified by clients.
    pub messages: usize,
    pub bytes: usize,
    /// Client disconnects seen by the server during teardown.
    pub disconnects: usize,
    pub ticks: u64,
}

/// Poll event with the payload copied out of the transport's pool.
enum Seen {
    Nothing,
    Connect(ConnectionHandle),
    Disconnect(ConnectionHandle),
    Data(ConnectionHandle, Vec<u8>),
}

impl fmt::Display for Seen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seen::Nothing => write!(f, "nothing"),
            Seen::Connect(h) => write!(f, "connect from {h}"),
            Seen::Disconnect(h) => write!(f, "disconnect of {h}"),
            Seen::Data(h, payload) => write!(f, "{} bytes from {h}", payload.len()),
        }
    }
}

struct Client {
    transport: Transport<LoopbackChannel>,
    connected: bool,
    /// Payloads sent and not yet echoed, oldest first.
    expected: VecDeque<Vec<u8>>,
}

/// Tick budget for one phase.
struct Phase {
    name: &'static str,
    budget: u64,
    used: u64,
}

impl Phase {
    fn new(name: &'static str, budget: u64) -> Self {
        debug!(phase = name, budget, "phase start");
        Self {
            name,
            budget,
            used: 0,
        }
    }

    fn tick(&mut self) -> anyhow::Result<()> {
        if self.used == self.budget {
            bail!("{} phase made no progress within {} ticks", self.name, self.budget);
        }
        self.used += 1;
        Ok(())
    }
}

fn poll(t: &mut Transport<LoopbackChannel>) -> anyhow::Result<Seen> {
    let result = t.poll()?;
    Ok(match result.event {
        NetworkEvent::Nothing => Seen::Nothing,
        NetworkEvent::Connect { handle } => Seen::Connect(handle),
        NetworkEvent::Disconnect { handle } => Seen::Disconnect(handle),
        NetworkEvent::Data { handle, payload } => Seen::Data(handle, payload.to_vec()),
    })
}

/// Connect every client, echo every configured size through the server, then tear down.
pub fn run(cfg: &Config) -> anyhow::Result<Report> {
    let channel = LoopbackChannel::new();
    let server_id = cfg.server_peer.unwrap_or_else(PeerId::generate);
    let mut server = Transport::new(
        channel.clone(),
        TransportSettings::new(server_id, server_id, &cfg.session_id),
    )?;
    server.initialize()?;
    server.start_server()?;
    info!(server = %server_id, session = %cfg.session_id, clients = cfg.clients, "server started");

    let mut clients = Vec::with_capacity(cfg.clients);
    for _ in 0..cfg.clients {
        let id = PeerId::generate();
        let mut transport = Transport::new(
            channel.clone(),
            TransportSettings::new(server_id, id, &cfg.session_id),
        )?;
        transport.initialize()?;
        transport.start_client()?;
        debug!(client = %id, "client started");
        clients.push(Client {
            transport,
            connected: false,
            expected: VecDeque::new(),
        });
    }

    let mut report = Report::default();

    let mut phase = Phase::new("connect", cfg.max_ticks);
    let mut accepted = 0;
    while accepted < cfg.clients || clients.iter().any(|c| !c.connected) {
        phase.tick()?;
        match poll(&mut server)? {
            Seen::Nothing => {}
            Seen::Connect(handle) => {
                accepted += 1;
                info!(handle, "client connected");
            }
            other => bail!("server: unexpected {other} while connecting"),
        }
        for (i, c) in clients.iter_mut().enumerate() {
            match poll(&mut c.transport)? {
                Seen::Nothing => {}
                Seen::Connect(SERVER_HANDLE) => c.connected = true,
                other => bail!("client {i}: unexpected {other} while connecting"),
            }
        }
    }
    report.ticks += phase.used;

    let mut rng = rand::thread_rng();
    for c in &mut clients {
        for &size in &cfg.message_sizes {
            let mut payload = vec![0u8; size];
            rng.fill_bytes(&mut payload);
            c.transport.send(SERVER_HANDLE, &payload, Delivery::Reliable)?;
            c.expected.push_back(payload);
        }
    }

    let mut phase = Phase::new("exchange", cfg.max_ticks);
    while clients.iter().any(|c| !c.expected.is_empty()) {
        phase.tick()?;
        match poll(&mut server)? {
            Seen::Nothing => {}
            Seen::Data(handle, payload) => {
                debug!(handle, size = payload.len(), "echo");
                server.send(handle, &payload, Delivery::ReliableSequenced)?;
            }
            other => bail!("server: unexpected {other} while exchanging"),
        }
        for (i, c) in clients.iter_mut().enumerate() {
            match poll(&mut c.transport)? {
                Seen::Nothing => {}
                Seen::Data(SERVER_HANDLE, payload) => {
                    let Some(sent) = c.expected.pop_front() else {
                        bail!("client {i}: echo of {} bytes that was never sent", payload.len());
                    };
                    ensure!(
                        payload == sent,
                        "client {i}: echo of {} bytes differs from what was sent",
                        sent.len()
                    );
                    report.messages += 1;
                    report.bytes += payload.len();
                }
                other => bail!("client {i}: unexpected {other} while exchanging"),
            }
        }
    }
    report.ticks += phase.used;
    info!(messages = report.messages, bytes = report.bytes, "exchange complete");

    for c in &mut clients {
        c.transport.shutdown();
    }
    let mut phase = Phase::new("teardown", cfg.max_ticks);
    while report.disconnects < cfg.clients {
        phase.tick()?;
        match poll(&mut server)? {
            Seen::Nothing => {}
            Seen::Disconnect(handle) => {
                report.disconnects += 1;
                info!(handle, "client disconnected");
            }
            other => bail!("server: unexpected {other} during teardown"),
        }
    }
    ensure!(
        server.registry().client_count() == 0,
        "server still tracks {} clients after teardown",
        server.registry().client_count()
    );
    server.shutdown();
    report.ticks += phase.used;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_every_size() {
        let cfg = Config {
            clients: 3,
            message_sizes: vec![0, 1, 1169, 1170, 1171, 3000, 20_000],
            ..Config::default()
        };
        let report = run(&cfg).unwrap();
        assert_eq!(report.messages, 3 * cfg.message_sizes.len());
        assert_eq!(report.bytes, 3 * cfg.message_sizes.iter().sum::<usize>());
        assert_eq!(report.disconnects, 3);
        assert!(report.ticks > 0);
    }

    #[test]
    fn default_config_runs() {
        let report = run(&Config::default()).unwrap();
        assert_eq!(report.messages, 8);
        assert_eq!(report.disconnects, 2);
    }

    #[test]
    fn pinned_server_identity() {
        let cfg = Config {
            server_peer: Some(PeerId::from_bytes([7; 16])),
            message_sizes: vec![10],
            ..Config::default()
        };
        assert_eq!(run(&cfg).unwrap().messages, 2);
    }

    #[test]
    fn tiny_budget_reports_stuck_phase() {
        let cfg = Config {
            max_ticks: 1,
            ..Config::default()
        };
        let err = run(&cfg).unwrap_err();
        assert!(err.to_string().contains("connect phase"), "{err}");
    }
}
