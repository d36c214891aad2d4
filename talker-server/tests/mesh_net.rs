//! Deterministic multi-server mesh tests.
//!
//! The harness plays both the network and the clock: servers are plain
//! [`ServerState`] values wired together over channel-backed links, events
//! are pumped until the mesh goes quiescent, and time only moves when a
//! test advances it. No sockets, no sleeps, no runtime.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};

use talker_server::client::{ClientHandle, SessionId};
use talker_server::mesh::{LinkId, PeerLink};
use talker_server::server::{Event, IoAction, ServerState};

struct TestClient {
    server: usize,
    id: SessionId,
    rx: mpsc::UnboundedReceiver<String>,
    shutdown: watch::Receiver<bool>,
    closed: bool,
}

struct LinkPair {
    a: usize,
    a_link: LinkId,
    a_rx: mpsc::UnboundedReceiver<String>,
    a_shutdown: watch::Receiver<bool>,
    b: usize,
    b_link: LinkId,
    b_rx: mpsc::UnboundedReceiver<String>,
    b_shutdown: watch::Receiver<bool>,
    closed: bool,
}

struct Net {
    servers: Vec<ServerState>,
    now: Instant,
    next_id: u64,
    listens: HashMap<u16, usize>,
    links: Vec<LinkPair>,
    clients: Vec<TestClient>,
}

impl Net {
    /// `n` servers with peer ids `s0..s{n-1}`, no links, no clients.
    fn new(n: usize, auth: bool) -> Self {
        let now = Instant::now();
        let servers = (0..n)
            .map(|i| ServerState::new(format!("s{i}"), auth, now))
            .collect();
        Self {
            servers,
            now,
            next_id: 1,
            listens: HashMap::new(),
            links: Vec::new(),
            clients: Vec::new(),
        }
    }

    fn alloc(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn add_client(&mut self, server: usize) -> usize {
        let id = SessionId(self.alloc());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = ClientHandle::new(id, format!("client-{}", id.0), out_tx, shutdown_tx);
        self.dispatch(server, Event::ClientOpen { handle });
        self.clients.push(TestClient {
            server,
            id,
            rx: out_rx,
            shutdown: shutdown_rx,
            closed: false,
        });
        self.clients.len() - 1
    }

    fn send(&mut self, client: usize, line: &str) {
        let (server, id) = (self.clients[client].server, self.clients[client].id);
        self.dispatch(
            server,
            Event::ClientLine {
                session: id,
                line: line.to_string(),
            },
        );
    }

    /// Drain everything the client has been sent since the last call.
    fn text(&mut self, client: usize) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.clients[client].rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    fn clear(&mut self) {
        for client in 0..self.clients.len() {
            let _ = self.text(client);
        }
    }

    fn dispatch(&mut self, server: usize, event: Event) {
        let actions = self.servers[server].handle_event(event, self.now);
        for action in actions {
            self.perform(server, action);
        }
    }

    fn perform(&mut self, server: usize, action: IoAction) {
        match action {
            IoAction::PeerListen { port, .. } => {
                self.listens.insert(port, server);
            }
            IoAction::PeerConnect { host, port } => match self.listens.get(&port).copied() {
                Some(to) => self.wire(server, to, &host, port),
                // Connection refused: no link ever registers.
                None => {}
            },
        }
    }

    /// Create a link pair between two servers, as if a dial to
    /// `host:port` had been accepted.
    fn wire(&mut self, from: usize, to: usize, host: &str, port: u16) {
        let a_link = LinkId(self.alloc());
        let b_link = LinkId(self.alloc());
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (a_shutdown_tx, a_shutdown) = watch::channel(false);
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (b_shutdown_tx, b_shutdown) = watch::channel(false);
        let a_peer = PeerLink::new(a_link, format!("{host}:{port}"), a_tx, a_shutdown_tx);
        let b_peer = PeerLink::new(b_link, format!("accepted-{b_link}"), b_tx, b_shutdown_tx);
        self.links.push(LinkPair {
            a: from,
            a_link,
            a_rx,
            a_shutdown,
            b: to,
            b_link,
            b_rx,
            b_shutdown,
            closed: false,
        });
        self.dispatch(from, Event::PeerOpen { link: a_peer });
        self.dispatch(to, Event::PeerOpen { link: b_peer });
    }

    /// Wire two servers directly, without going through client commands.
    fn link(&mut self, a: usize, b: usize) {
        let port = 2000 + b as u16;
        self.listens.insert(port, b);
        self.wire(a, b, "0.0.0.0", port);
    }

    /// Deliver everything in flight, in creation order, until quiescent.
    fn pump(&mut self) {
        loop {
            let mut progressed = self.settle_closes();

            let mut deliveries = Vec::new();
            for pair in &mut self.links {
                if pair.closed {
                    continue;
                }
                while let Ok(line) = pair.a_rx.try_recv() {
                    deliveries.push((pair.b, pair.b_link, line));
                }
                while let Ok(line) = pair.b_rx.try_recv() {
                    deliveries.push((pair.a, pair.a_link, line));
                }
            }
            progressed |= !deliveries.is_empty();
            if !progressed {
                break;
            }
            for (to, link, line) in deliveries {
                self.dispatch(to, Event::PeerLine { link, line });
            }
        }
    }

    /// Deliver one random in-flight line at a time until quiescent,
    /// exercising arrival-order permutations across the mesh.
    fn pump_randomly(&mut self, rng: &mut StdRng) {
        loop {
            self.settle_closes();
            let mut ready = Vec::new();
            for (index, pair) in self.links.iter().enumerate() {
                if pair.closed {
                    continue;
                }
                if !pair.a_rx.is_empty() {
                    ready.push((index, true));
                }
                if !pair.b_rx.is_empty() {
                    ready.push((index, false));
                }
            }
            if ready.is_empty() {
                break;
            }
            let (index, from_a) = ready[rng.gen_range(0..ready.len())];
            let pair = &mut self.links[index];
            let (to, link, line) = if from_a {
                (pair.b, pair.b_link, pair.a_rx.try_recv().unwrap())
            } else {
                (pair.a, pair.a_link, pair.b_rx.try_recv().unwrap())
            };
            self.dispatch(to, Event::PeerLine { link, line });
        }
    }

    /// Propagate shutdown signals: closed links and sessions report to both
    /// ends, dropping anything still queued on them.
    fn settle_closes(&mut self) -> bool {
        let mut progressed = false;
        for index in 0..self.links.len() {
            let fire = {
                let pair = &self.links[index];
                !pair.closed && (*pair.a_shutdown.borrow() || *pair.b_shutdown.borrow())
            };
            if fire {
                self.links[index].closed = true;
                progressed = true;
                let (a, a_link, b, b_link) = {
                    let pair = &self.links[index];
                    (pair.a, pair.a_link, pair.b, pair.b_link)
                };
                self.dispatch(a, Event::PeerClosed { link: a_link });
                self.dispatch(b, Event::PeerClosed { link: b_link });
            }
        }
        for index in 0..self.clients.len() {
            let fire = {
                let client = &self.clients[index];
                !client.closed && *client.shutdown.borrow()
            };
            if fire {
                self.clients[index].closed = true;
                progressed = true;
                let (server, id) = (self.clients[index].server, self.clients[index].id);
                self.dispatch(server, Event::ClientClosed { session: id });
            }
        }
        progressed
    }

    /// Move the clock and tick every server.
    fn advance(&mut self, dt: Duration) {
        self.now += dt;
        let now = self.now;
        for server in &mut self.servers {
            server.tick(now);
        }
    }

    fn reachable(&self, server: usize) -> HashSet<String> {
        self.servers[server].topology.reachable()
    }
}

fn ids(names: &[&str]) -> HashSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[test]
fn single_server_who() {
    let mut net = Net::new(1, false);
    let c = net.add_client(0);
    let text = net.text(c);
    assert!(text[0].starts_with("Welcome, "), "got {text:?}");

    net.send(c, "/nick jan");
    net.send(c, "/who");
    assert_eq!(net.text(c), vec!["There are 1 users online:", "jan"]);
}

#[test]
fn failed_connect_then_two_server_who() {
    let mut net = Net::new(2, false);
    let c0 = net.add_client(0);
    let c1 = net.add_client(1);
    net.send(c0, "/nick client0");
    net.send(c1, "/nick client1");
    net.clear();

    // Dial before anything listens: the link never registers.
    net.send(c1, "/peer-connect 0.0.0.0 2000");
    net.pump();
    net.send(c1, "/peers");
    assert_eq!(net.text(c1), vec!["There are 0 peers directly connected"]);

    net.send(c0, "/peer-listen 0.0.0.0 2000");
    net.send(c1, "/peer-listen 0.0.0.0 2001");
    net.send(c1, "/peer-connect 0.0.0.0 2000");
    net.pump();

    net.send(c0, "/peers");
    let text = net.text(c0);
    assert_eq!(text[0], "There are 1 peers directly connected");
    net.send(c1, "/peers");
    assert_eq!(
        net.text(c1),
        vec![
            "There are 1 peers directly connected".to_string(),
            "Peer(0.0.0.0:2000)".to_string(),
        ]
    );

    net.clear();
    net.send(c0, "/who");
    net.send(c1, "/who");
    net.pump();
    for client in [c0, c1] {
        assert_eq!(
            net.text(client),
            vec![
                "There are 2 users online on 2 servers:",
                "  Server: s0",
                "    client0",
                "  Server: s1",
                "    client1",
            ]
        );
    }
}

#[test]
fn random_fifteen_server_mesh() {
    const N: usize = 15;
    let mut net = Net::new(N, false);
    let clients: Vec<usize> = (0..N).map(|server| net.add_client(server)).collect();
    for (index, &client) in clients.iter().enumerate() {
        net.send(client, &format!("/nick client{index}"));
        net.send(client, &format!("/peer-listen 0.0.0.0 {}", 2000 + index));
    }

    let mut rng = StdRng::seed_from_u64(0x7a1e);
    for &client in &clients {
        let target = 2000 + rng.gen_range(0..N);
        net.send(client, &format!("/peer-connect 0.0.0.0 {target}"));
        net.pump_randomly(&mut rng);
    }
    net.pump();
    net.clear();

    // One dial per server: fifteen edges, thirty link ends.
    let mut total = 0;
    for &client in &clients {
        net.send(client, "/peers");
        let text = net.text(client);
        let words: Vec<&str> = text[0].split_whitespace().collect();
        assert_eq!(&words[..2], ["There", "are"]);
        assert_eq!(&words[3..], ["peers", "directly", "connected"]);
        total += words[2].parse::<usize>().unwrap();
    }
    assert_eq!(total, 2 * N);
}

#[test]
fn speech_delivered_once_across_cyclic_mesh() {
    let mut net = Net::new(3, false);
    let clients: Vec<usize> = (0..3).map(|server| net.add_client(server)).collect();
    for (index, &client) in clients.iter().enumerate() {
        net.send(client, &format!("/nick client{index}"));
    }
    // A cycle: every frame has two routes to every server.
    net.link(0, 1);
    net.link(1, 2);
    net.link(2, 0);
    net.pump();
    net.clear();

    net.send(clients[0], "hello everyone");
    net.pump();
    for &client in &clients {
        assert_eq!(net.text(client), vec!["client0: hello everyone"]);
    }
}

#[test]
fn topology_converges_and_partitions() {
    let mut net = Net::new(4, false);
    let clients: Vec<usize> = (0..4).map(|server| net.add_client(server)).collect();
    net.send(clients[1], "/peer-listen 0.0.0.0 2001");
    net.send(clients[2], "/peer-connect 0.0.0.0 2001");
    net.link(1, 0);
    net.link(3, 2);
    net.pump();
    net.clear();

    let all = ids(&["s0", "s1", "s2", "s3"]);
    for server in 0..4 {
        assert_eq!(net.reachable(server), all, "server {server}");
    }

    net.send(clients[1], "/reachable");
    assert_eq!(
        net.text(clients[1])[0],
        "There are 4 reachable peers:".to_string()
    );

    // Cut the middle: the mesh splits into two components.
    net.send(clients[2], "/peer-kill 0.0.0.0 2001");
    let killed = net.text(clients[2]);
    assert_eq!(killed, vec!["Shutting down Peer(0.0.0.0:2001)"]);
    net.pump();

    assert_eq!(net.reachable(0), ids(&["s0", "s1"]));
    assert_eq!(net.reachable(1), ids(&["s0", "s1"]));
    assert_eq!(net.reachable(2), ids(&["s2", "s3"]));
    assert_eq!(net.reachable(3), ids(&["s2", "s3"]));
}

#[test]
fn who_times_out_when_a_peer_stays_silent() {
    let mut net = Net::new(1, false);
    let c = net.add_client(0);
    net.send(c, "/nick jan");

    // Hand-wire a link whose far side is a mute script, not a server.
    let mute = LinkId(net.alloc());
    let (out_tx, _mute_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _mute_shutdown) = watch::channel(false);
    let link = PeerLink::new(mute, "10.9.9.9:2000".to_string(), out_tx, shutdown_tx);
    net.dispatch(0, Event::PeerOpen { link });
    net.dispatch(
        0,
        Event::PeerLine {
            link: mute,
            line: "!z9|1|Topology|i-am|".to_string(),
        },
    );
    net.dispatch(
        0,
        Event::PeerLine {
            link: mute,
            line: "z9|2|Topology|i-see|s0".to_string(),
        },
    );
    assert_eq!(net.reachable(0), ids(&["s0", "z9"]));

    net.clear();
    net.send(c, "/who");
    // z9 never answers, so nothing renders yet.
    assert!(net.text(c).is_empty());

    // One rotation parks the request in the older generation, the next
    // surrenders it with whatever arrived.
    net.advance(Duration::from_secs(1));
    net.advance(Duration::from_secs(1));
    assert_eq!(net.text(c), vec!["There are 1 users online:", "jan"]);
}

#[test]
fn new_user_login_flow() {
    let mut net = Net::new(1, true);
    let c = net.add_client(0);
    let text = net.text(c);
    assert_eq!(text.len(), 1);
    assert!(text[0].starts_with("Enter your username,"), "got {text:?}");

    net.send(c, "not a name!");
    assert_eq!(net.text(c), vec!["Usernames must be alphanumeric. Try again:"]);

    net.send(c, "foo");
    assert_eq!(net.text(c), vec!["A new user! Enter your password:"]);
    net.send(c, "bar");
    assert_eq!(net.text(c), vec!["Confirm your password:"]);
    net.send(c, "bar");
    assert_eq!(net.text(c), vec!["Welcome, foo", "foo has joined"]);

    net.send(c, "hello, world");
    assert_eq!(net.text(c), vec!["foo: hello, world"]);
}

#[test]
fn returning_user_logs_in_with_existing_password() {
    let mut net = Net::new(1, true);
    let first = net.add_client(0);
    net.send(first, "foo");
    net.send(first, "bar");
    net.send(first, "bar");
    net.clear();

    let second = net.add_client(0);
    let text = net.text(second);
    assert!(text[0].starts_with("Enter your username,"));
    net.send(second, "foo");
    assert_eq!(net.text(second), vec!["Enter password:"]);
    net.send(second, "wrong");
    assert_eq!(net.text(second), vec!["Enter password:"]);
    net.send(second, "bar");
    assert_eq!(net.text(second), vec!["Welcome, foo", "foo has joined"]);
}

#[test]
fn three_password_failures_disconnect() {
    let mut net = Net::new(1, true);
    let first = net.add_client(0);
    net.send(first, "foo");
    net.send(first, "bar");
    net.send(first, "bar");
    net.clear();

    let second = net.add_client(0);
    net.clear();
    net.send(second, "foo");
    assert_eq!(net.text(second), vec!["Enter password:"]);
    net.send(second, "x");
    assert_eq!(net.text(second), vec!["Enter password:"]);
    net.send(second, "y");
    assert_eq!(net.text(second), vec!["Enter password:"]);
    net.send(second, "z");
    assert_eq!(net.text(second), vec!["Incorrect password."]);

    // Rejected: input is discarded while the socket drains shut.
    net.send(second, "bar");
    assert!(net.text(second).is_empty());
    net.pump();
    assert!(net.clients[second].closed);
    // Only the original session speaks for foo.
    assert_eq!(net.servers[0].speaker_names(), vec!["foo"]);
}

#[test]
fn mismatched_passwords_disconnect() {
    let mut net = Net::new(1, true);
    let c = net.add_client(0);
    net.clear();
    net.send(c, "foo");
    net.send(c, "bar");
    net.clear();
    net.send(c, "baz");
    assert_eq!(net.text(c), vec!["Passwords do not match."]);
}

#[test]
fn accounts_replicate_across_the_mesh() {
    let mut net = Net::new(2, true);
    net.link(0, 1);
    net.pump();

    let creator = net.add_client(0);
    net.clear();
    net.send(creator, "foo");
    net.pump();
    assert_eq!(net.text(creator), vec!["A new user! Enter your password:"]);
    net.send(creator, "bar");
    net.send(creator, "bar");
    net.pump();
    assert!(net.servers[1].login.account("foo").is_some());

    // The same user reconnects to the other server and is already known.
    let returning = net.add_client(1);
    net.clear();
    net.send(returning, "foo");
    net.pump();
    assert_eq!(net.text(returning), vec!["Enter password:"]);
    net.send(returning, "bar");
    let text = net.text(returning);
    assert_eq!(text[0], "Welcome, foo");
}

#[test]
fn tell_kill_and_unknown_commands() {
    let mut net = Net::new(1, false);
    let alice = net.add_client(0);
    let bob = net.add_client(0);
    net.send(alice, "/nick alice");
    net.send(bob, "/nick bob");
    net.clear();

    net.send(alice, "/tell bob psst hello");
    assert_eq!(net.text(bob), vec!["alice tells you: psst hello"]);
    assert!(net.text(alice).is_empty());

    net.send(alice, "/tell carol hi");
    assert_eq!(
        net.text(alice),
        vec!["Something went wrong trying to do that: no such user: carol"]
    );

    net.send(alice, "/frobnicate now");
    assert_eq!(net.text(alice), vec!["Unknown command: /frobnicate"]);

    net.send(alice, "/peer-connect localhost notaport");
    assert_eq!(
        net.text(alice),
        vec!["Something went wrong trying to do that: bad port \"notaport\""]
    );

    net.send(alice, "/kill bob");
    net.pump();
    let text = net.text(alice);
    assert!(text.iter().any(|line| line == "bob has left"), "got {text:?}");
    assert_eq!(net.servers[0].speaker_names(), vec!["alice"]);
}

#[test]
fn quit_unregisters_the_speaker() {
    let mut net = Net::new(1, false);
    let a = net.add_client(0);
    let b = net.add_client(0);
    net.send(a, "/nick alice");
    net.send(b, "/nick bob");
    net.clear();

    net.send(b, "/quit");
    net.pump();
    let text = net.text(a);
    assert!(text.iter().any(|line| line == "bob has left"), "got {text:?}");
    assert_eq!(net.servers[0].speaker_names(), vec!["alice"]);
}

#[test]
fn raw_broadcast_is_flooded_and_dropped_quietly() {
    let mut net = Net::new(2, false);
    let c0 = net.add_client(0);
    let c1 = net.add_client(1);
    net.link(0, 1);
    net.pump();
    net.clear();

    // No observer claims the payload; it crosses the mesh and vanishes.
    net.send(c0, "/broadcast testing the flood");
    net.pump();
    assert!(net.text(c0).is_empty());
    assert!(net.text(c1).is_empty());
}
