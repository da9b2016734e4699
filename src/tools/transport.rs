//! UDP plumbing: fire-and-forget sends and per-node drain listeners.
//!
//! The listeners carry no simulation state. They exist so that every packet
//! the engine emits crosses a real socket, and they drain their port until
//! the termination sentinel arrives.

use std::{
    io,
    net::{Ipv4Addr, UdpSocket},
    thread::{self, JoinHandle},
};

use tracing::{debug, warn};

use crate::protocol::constants::TERMINATE_SIMULATION;

/// One sending socket plus a drain listener per node port.
pub struct SocketTransport {
    sender: UdpSocket,
    ports: Vec<u16>,
    listeners: Vec<JoinHandle<()>>,
    terminated: bool,
}

impl SocketTransport {
    /// Binds every node port on localhost and spawns its drain loop.
    pub fn start(ports: Vec<u16>, datagram_size: usize) -> io::Result<Self> {
        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;

        let mut listeners = Vec::with_capacity(ports.len());
        for &port in &ports {
            let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, port))?;
            listeners.push(thread::spawn(move || drain(socket, datagram_size)));
        }

        Ok(Self {
            sender,
            ports,
            listeners,
            terminated: false,
        })
    }

    /// Emits a datagram towards a node port.
    ///
    /// The wire is a side effect only: a failed send means the packet is
    /// lost at the wire and the simulation carries on.
    pub fn send(&self, bytes: &[u8], port: u16) {
        if let Err(e) = self.sender.send_to(bytes, (Ipv4Addr::LOCALHOST, port)) {
            debug!("dropped a datagram to port {port}: {e}");
        }
    }

    /// Sends the sentinel to every listener once and joins them.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        for &port in &self.ports {
            self.send(TERMINATE_SIMULATION, port);
        }
        for handle in self.listeners.drain(..) {
            if handle.join().is_err() {
                warn!("a listener thread panicked during shutdown");
            }
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn drain(socket: UdpSocket, datagram_size: usize) {
    let mut buffer = vec![0u8; datagram_size.max(TERMINATE_SIMULATION.len())];

    loop {
        match socket.recv_from(&mut buffer) {
            Ok((len, _)) if &buffer[..len] == TERMINATE_SIMULATION => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("listener socket failed: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn listeners_drain_until_the_sentinel() {
        let ports = vec![56701, 56702];
        let mut transport =
            SocketTransport::start(ports.clone(), 128).expect("couldn't bind the node ports");

        for port in ports {
            transport.send(b"not a sentinel", port);
            transport.send(&[0u8; 128], port);
        }

        // Joins hang forever if the sentinel is not recognised.
        transport.terminate();
        assert!(transport.listeners.is_empty());
    }

    #[test]
    fn send_to_an_unbound_port_is_absorbed() {
        let mut transport = SocketTransport::start(vec![56703], 128).unwrap();
        transport.send(b"anyone there?", 56704);
        transport.terminate();
    }

    #[test]
    fn terminate_twice_is_a_no_op() {
        let mut transport = SocketTransport::start(vec![56705], 128).unwrap();
        transport.terminate();
        transport.terminate();
    }
}
