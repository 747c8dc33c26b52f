//! Star topology provisioning over Linux network namespaces.
//!
//! One proxy namespace in the middle, one namespace per backend server and
//! per load client, each connected to the proxy by its own veth pair.
//! Addressing is a pure function of (role, index), so repeated provisioning
//! always yields an identical topology. Teardown is best-effort and removes
//! every namespace matching the harness prefix, which makes
//! teardown-then-provision safe even after a crashed prior run.

use std::fmt;
use std::io;
use std::process::Output;

use crate::runner::CommandRunner;

/// Prefix shared by every namespace the harness creates.
pub const NS_PREFIX: &str = "pmk_";

/// Largest per-role index the /24-per-peer address plan can represent.
pub const MAX_PEERS: u16 = 254;

/// Which emulated host a namespace plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Proxy,
    Server(u16),
    Client(u16),
}

impl Role {
    /// Namespace name for this role, always under [`NS_PREFIX`].
    pub fn ns_name(&self) -> String {
        match self {
            Role::Proxy => format!("{NS_PREFIX}proxy"),
            Role::Server(i) => format!("{NS_PREFIX}srv{i}"),
            Role::Client(j) => format!("{NS_PREFIX}cli{j}"),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Proxy => write!(f, "proxy"),
            Role::Server(i) => write!(f, "server{i}"),
            Role::Client(j) => write!(f, "client{j}"),
        }
    }
}

/// Deterministic (role, index) → IPv4 address mapping.
///
/// Server links live in `10.1.i.0/24`, client links in `10.2.j.0/24`; the
/// proxy-facing endpoint is always `.1` and the peer `.2`. The two numbered
/// families can never collide for any server/client counts.
pub struct AddressPlan;

impl AddressPlan {
    fn family(role: Role) -> (u8, u16) {
        match role {
            Role::Proxy => panic!("proxy has no dedicated subnet"),
            Role::Server(i) => (1, i),
            Role::Client(j) => (2, j),
        }
    }

    /// `/24` subnet of the link between the proxy and `role`.
    pub fn subnet(role: Role) -> String {
        let (fam, idx) = Self::family(role);
        format!("10.{fam}.{idx}.0/24")
    }

    /// Address of the proxy-side endpoint on the link to `role`.
    pub fn proxy_addr(role: Role) -> String {
        let (fam, idx) = Self::family(role);
        format!("10.{fam}.{idx}.1")
    }

    /// Address of `role`'s own endpoint on its link to the proxy.
    pub fn peer_addr(role: Role) -> String {
        let (fam, idx) = Self::family(role);
        format!("10.{fam}.{idx}.2")
    }
}

/// Interface name on the proxy side of the link to `role`.
///
/// Stays well under the 15-character Linux interface name limit for all
/// representable indices.
fn proxy_iface(role: Role) -> String {
    match role {
        Role::Proxy => unreachable!("no proxy-to-proxy link"),
        Role::Server(i) => format!("vs{i}p"),
        Role::Client(j) => format!("vc{j}p"),
    }
}

/// Interface name on the peer side of the link to `role`.
fn peer_iface(role: Role) -> String {
    match role {
        Role::Proxy => unreachable!("no proxy-to-proxy link"),
        Role::Server(i) => format!("vs{i}s"),
        Role::Client(j) => format!("vc{j}c"),
    }
}

/// A provisioned network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
    pub role: Role,
}

impl Namespace {
    /// Run a command inside this namespace.
    pub fn exec(
        &self,
        runner: &dyn CommandRunner,
        program: &str,
        args: &[&str],
    ) -> io::Result<Output> {
        let mut full: Vec<&str> = vec!["netns", "exec", &self.name, program];
        full.extend_from_slice(args);
        runner.run("ip", &full)
    }
}

/// A veth pair between the proxy namespace and one peer namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub peer_role: Role,
    pub peer_ns: String,
    pub proxy_iface: String,
    pub peer_iface: String,
    pub proxy_addr: String,
    pub peer_addr: String,
}

impl Link {
    /// True when this link connects a load client to the proxy. Only these
    /// links are ever impaired.
    pub fn is_client_link(&self) -> bool {
        matches!(self.peer_role, Role::Client(_))
    }
}

/// All namespaces and links of one run. Owned exclusively by whoever
/// provisioned it; drop does nothing. Teardown is explicit so the caller
/// controls when (and through which runner) cleanup happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub proxy: Namespace,
    pub servers: Vec<Namespace>,
    pub clients: Vec<Namespace>,
    pub links: Vec<Link>,
}

impl Topology {
    /// Create the full star topology: teardown of stale harness namespaces,
    /// then namespaces, then one veth link per peer.
    ///
    /// Per-link ordering is strict: create pair → move endpoints into their
    /// namespaces → bring both up → assign addresses. Assigning to a down
    /// interface is how half-initialized links fail, so addresses come last.
    pub fn provision(
        runner: &dyn CommandRunner,
        server_count: u16,
        client_count: u16,
    ) -> io::Result<Topology> {
        if server_count == 0 || client_count == 0 {
            return Err(io::Error::other(
                "topology requires at least one server and one client",
            ));
        }
        if server_count > MAX_PEERS || client_count > MAX_PEERS {
            return Err(io::Error::other(format!(
                "at most {MAX_PEERS} servers and {MAX_PEERS} clients are addressable"
            )));
        }

        // Best-effort removal of anything a previous run left behind.
        teardown_all(runner);

        let proxy = create_namespace(runner, Role::Proxy)?;

        let mut servers = Vec::with_capacity(server_count as usize);
        for i in 1..=server_count {
            servers.push(create_namespace(runner, Role::Server(i))?);
        }

        let mut clients = Vec::with_capacity(client_count as usize);
        for j in 1..=client_count {
            clients.push(create_namespace(runner, Role::Client(j))?);
        }

        let mut links = Vec::with_capacity(servers.len() + clients.len());
        for peer in servers.iter().chain(clients.iter()) {
            links.push(create_link(runner, &proxy, peer)?);
        }

        tracing::info!(
            servers = server_count,
            clients = client_count,
            "topology provisioned"
        );

        Ok(Topology {
            proxy,
            servers,
            clients,
            links,
        })
    }

    /// Remove every namespace of this topology. Best-effort; missing
    /// namespaces are not an error.
    pub fn teardown(&self, runner: &dyn CommandRunner) {
        teardown_all(runner);
    }

    /// The link connecting `role` to the proxy.
    pub fn link_for(&self, role: Role) -> Option<&Link> {
        self.links.iter().find(|l| l.peer_role == role)
    }
}

/// Delete every namespace matching [`NS_PREFIX`], ignoring failures.
///
/// Works purely from `ip netns list` so it also cleans up after a crashed
/// run that never produced a [`Topology`] value.
pub fn teardown_all(runner: &dyn CommandRunner) {
    let listing = match runner.run("ip", &["netns", "list"]) {
        Ok(out) => String::from_utf8_lossy(&out.stdout).into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "could not list namespaces during teardown");
            return;
        }
    };

    for line in listing.lines() {
        // `ip netns list` prints "<name>" or "<name> (id: N)"
        let name = line.split_whitespace().next().unwrap_or("");
        if !name.starts_with(NS_PREFIX) {
            continue;
        }
        match runner.run("ip", &["netns", "del", name]) {
            Ok(out) if !out.status.success() => {
                tracing::warn!(
                    ns = name,
                    stderr = %String::from_utf8_lossy(&out.stderr),
                    "namespace deletion failed during teardown"
                );
            }
            Err(e) => {
                tracing::warn!(ns = name, error = %e, "namespace deletion failed during teardown");
            }
            _ => {}
        }
    }
}

fn create_namespace(runner: &dyn CommandRunner, role: Role) -> io::Result<Namespace> {
    let name = role.ns_name();

    let output = runner.run("ip", &["netns", "add", &name])?;
    check(output, &format!("create netns {name}"))?;

    let ns = Namespace { name, role };

    // Loopback up so in-namespace tooling behaves normally.
    let output = ns.exec(runner, "ip", &["link", "set", "lo", "up"])?;
    check(output, &format!("bring up lo in {}", ns.name))?;

    Ok(ns)
}

fn create_link(runner: &dyn CommandRunner, proxy: &Namespace, peer: &Namespace) -> io::Result<Link> {
    let role = peer.role;
    let local = proxy_iface(role);
    let remote = peer_iface(role);

    // Leftover host-side veth from an interrupted run would collide.
    let _ = runner.run("ip", &["link", "del", &local]);

    // 1. Create the pair in the host namespace.
    let output = runner.run(
        "ip",
        &["link", "add", &local, "type", "veth", "peer", "name", &remote],
    )?;
    check(output, &format!("create veth pair {local}/{remote}"))?;

    // 2. Move both endpoints.
    let output = runner.run("ip", &["link", "set", &local, "netns", &proxy.name])?;
    check(output, &format!("move {local} into {}", proxy.name))?;

    let output = runner.run("ip", &["link", "set", &remote, "netns", &peer.name])?;
    check(output, &format!("move {remote} into {}", peer.name))?;

    // 3. Bring both up.
    let output = proxy.exec(runner, "ip", &["link", "set", &local, "up"])?;
    check(output, &format!("bring up {local}"))?;

    let output = peer.exec(runner, "ip", &["link", "set", &remote, "up"])?;
    check(output, &format!("bring up {remote}"))?;

    // 4. Assign addresses.
    let proxy_addr = AddressPlan::proxy_addr(role);
    let peer_addr = AddressPlan::peer_addr(role);

    let cidr = format!("{proxy_addr}/24");
    let output = proxy.exec(runner, "ip", &["addr", "add", &cidr, "dev", &local])?;
    check(output, &format!("assign {cidr} to {local}"))?;

    let cidr = format!("{peer_addr}/24");
    let output = peer.exec(runner, "ip", &["addr", "add", &cidr, "dev", &remote])?;
    check(output, &format!("assign {cidr} to {remote}"))?;

    Ok(Link {
        peer_role: role,
        peer_ns: peer.name.clone(),
        proxy_iface: local,
        peer_iface: remote,
        proxy_addr,
        peer_addr,
    })
}

fn check(output: Output, what: &str) -> io::Result<Output> {
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "failed to {what}: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output)
}
