//! UDP relay: per-source NAT session table, trial-decryption per datagram,
//! pending-dial coalescing, DNS-aware idle timeout selection.

use super::auth_udp;
use crate::common::{bufpool, net};
use crate::config::Group;
use crate::usercontext::UserContextPool;
use crate::Result;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MTU: usize = 65535;
pub const DEFAULT_NAT_TIMEOUT: Duration = Duration::from_secs(3 * 60);
pub const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(17);

struct GroupState {
    group: Group,
    pool: UserContextPool,
}

impl GroupState {
    fn new(group: Group) -> Self {
        GroupState {
            group,
            pool: UserContextPool::with_default_ttl(),
        }
    }
}

struct UdpSession {
    upstream: UdpSocket,
    client_addr: SocketAddr,
    timeout: Duration,
    last_activity: Mutex<Instant>,
    reverse_handle: Mutex<Option<JoinHandle<()>>>,
}

enum SessionSlot {
    Pending(Arc<Notify>),
    Ready(Arc<UdpSession>),
}

pub struct UdpDispatcher {
    port: u16,
    state: Arc<RwLock<Arc<GroupState>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UdpDispatcher {
    pub async fn spawn(group: Group) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", group.port)).await?);
        let port = socket.local_addr()?.port();
        let state = Arc::new(RwLock::new(Arc::new(GroupState::new(group))));
        let sessions: Arc<DashMap<String, SessionSlot>> = Arc::new(DashMap::new());
        let task_state = state.clone();
        let handle = tokio::spawn(recv_loop(socket, task_state, sessions));
        Ok(UdpDispatcher {
            port,
            state,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn update_group(&self, group: Group) {
        let new_state = Arc::new(GroupState::new(group));
        let old = std::mem::replace(&mut *self.state.write(), new_state);
        old.pool.close_all();
    }

    pub fn close(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    state: Arc<RwLock<Arc<GroupState>>>,
    sessions: Arc<DashMap<String, SessionSlot>>,
) {
    loop {
        let mut buf = bufpool::acquire(MTU);
        match socket.recv_from(buf.as_mut_slice()).await {
            Ok((n, src)) => {
                buf.truncate(n);
                let socket = socket.clone();
                let state = state.clone();
                let sessions = sessions.clone();
                tokio::spawn(async move {
                    handle_datagram(socket, state, sessions, src, buf.into_vec()).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "udp recv error");
            }
        }
    }
}

async fn handle_datagram(
    socket: Arc<UdpSocket>,
    state: Arc<RwLock<Arc<GroupState>>>,
    sessions: Arc<DashMap<String, SessionSlot>>,
    src: SocketAddr,
    datagram: Vec<u8>,
) {
    let key = src.to_string();

    loop {
        let existing = sessions.get(&key).map(|e| match e.value() {
            SessionSlot::Ready(s) => SessionSlot::Ready(s.clone()),
            SessionSlot::Pending(n) => SessionSlot::Pending(n.clone()),
        });

        match existing {
            Some(SessionSlot::Ready(session)) => {
                *session.last_activity.lock() = Instant::now();
                send_with_deadline(&session, &datagram, &sessions, &key).await;
                return;
            }
            Some(SessionSlot::Pending(notify)) => {
                notify.notified().await;
                continue;
            }
            None => {
                let notify = Arc::new(Notify::new());
                let inserted = {
                    use dashmap::mapref::entry::Entry;
                    match sessions.entry(key.clone()) {
                        Entry::Occupied(_) => false,
                        Entry::Vacant(v) => {
                            v.insert(SessionSlot::Pending(notify.clone()));
                            true
                        }
                    }
                };
                if !inserted {
                    continue; // lost the race; re-enter the lookup
                }

                establish_session(&socket, &state, &sessions, src, &key, &datagram, &notify).await;
                return;
            }
        }
    }
}

async fn establish_session(
    socket: &Arc<UdpSocket>,
    state: &Arc<RwLock<Arc<GroupState>>>,
    sessions: &Arc<DashMap<String, SessionSlot>>,
    src: SocketAddr,
    key: &str,
    datagram: &[u8],
    notify: &Arc<Notify>,
) {
    let group_state = state.read().clone();
    let (ctx, evicted) = group_state
        .pool
        .get_or_insert(&src.ip().to_string(), &group_state.group.servers);
    for e in evicted {
        e.close();
    }
    let snapshot = ctx.snapshot();

    let Some((node, plaintext)) = auth_udp(&snapshot, datagram) else {
        sessions.remove(key);
        notify.notify_waiters();
        return;
    };

    let upstream = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "udp upstream bind failed");
            sessions.remove(key);
            notify.notify_waiters();
            return;
        }
    };
    if let Err(e) = upstream.connect(&node.server.target).await {
        warn!(error = %e, target = %node.server.target, "udp upstream connect failed");
        sessions.remove(key);
        notify.notify_waiters();
        return;
    }

    let timeout = idle_timeout_for(&plaintext);
    let session = Arc::new(UdpSession {
        upstream,
        client_addr: src,
        timeout,
        last_activity: Mutex::new(Instant::now()),
        reverse_handle: Mutex::new(None),
    });

    sessions.insert(key.to_string(), SessionSlot::Ready(session.clone()));
    notify.notify_waiters();

    debug!(target = %node.server.target, peer = %src, timeout_secs = timeout.as_secs(), "udp session established");

    let reverse_socket = socket.clone();
    let reverse_sessions = sessions.clone();
    let reverse_key = key.to_string();
    let reverse_session = session.clone();
    let reverse_task = tokio::spawn(async move {
        reverse_relay(reverse_socket, reverse_session, reverse_sessions, reverse_key).await;
    });
    *session.reverse_handle.lock() = Some(reverse_task);

    send_with_deadline(&session, datagram, sessions, key).await;
}

/// Writes to the upstream with a deadline equal to `DEFAULT_NAT_TIMEOUT`
/// (spec §5). On timeout or error the session is removed from the table and
/// its reverse task is aborted, same as the reverse task's own exit path.
async fn send_with_deadline(
    session: &Arc<UdpSession>,
    datagram: &[u8],
    sessions: &DashMap<String, SessionSlot>,
    key: &str,
) {
    match tokio::time::timeout(DEFAULT_NAT_TIMEOUT, session.upstream.send(datagram)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            debug!(error = %e, "udp upstream send failed");
            teardown_session(session, sessions, key);
        }
        Err(_) => {
            warn!("udp upstream send timed out");
            teardown_session(session, sessions, key);
        }
    }
}

fn teardown_session(session: &Arc<UdpSession>, sessions: &DashMap<String, SessionSlot>, key: &str) {
    sessions.remove(key);
    if let Some(handle) = session.reverse_handle.lock().take() {
        handle.abort();
    }
}

async fn reverse_relay(
    listener: Arc<UdpSocket>,
    session: Arc<UdpSession>,
    sessions: Arc<DashMap<String, SessionSlot>>,
    key: String,
) {
    loop {
        let mut buf = bufpool::acquire(MTU);
        let recv = tokio::time::timeout(session.timeout, session.upstream.recv(buf.as_mut_slice())).await;
        match recv {
            Ok(Ok(n)) => {
                *session.last_activity.lock() = Instant::now();
                if listener.send_to(&buf.as_slice()[..n], session.client_addr).await.is_err() {
                    break;
                }
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }
    sessions.remove(&key);
}

/// Decides the session's read-idle timeout from the decrypted datagram's
/// Shadowsocks address header: `DNS_QUERY_TIMEOUT` if the bytes following
/// the address look like a DNS query header, else `DEFAULT_NAT_TIMEOUT`.
fn idle_timeout_for(plaintext: &[u8]) -> Duration {
    let Some(addr_len) = net::socks_addr_len(plaintext) else {
        return DEFAULT_NAT_TIMEOUT;
    };
    let rest = &plaintext[addr_len..];
    if looks_like_dns_query(rest) {
        DNS_QUERY_TIMEOUT
    } else {
        DEFAULT_NAT_TIMEOUT
    }
}

/// Structural check only: a 12-byte DNS header with a nonzero question
/// count. Not a full RFC 1035 parse.
fn looks_like_dns_query(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    qdcount >= 1
}
