//! Standalone TCP port-forwarding rule engine.
//!
//! A [`ForwardManager`] holds a table of [`ForwardRule`]s, each describing a
//! `listen_port -> target_host:target_port` mapping, plus one engine-wide
//! `running` flag (§4.4): `start()` launches one acceptor per currently
//! active rule, `stop()` flips the flag and lets every acceptor drain at its
//! next accept boundary. `active` on a rule just gates whether a *running*
//! acceptor keeps accepting; enabling a rule while the engine is already
//! running is this manager's job too (spec §4.4), not the caller's.

pub mod error;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use error::{ForwardError, Result};

/// Upper bound on the number of configured rules, matching
/// `MAX_FORWARD_RULES` in the original implementation.
pub const MAX_RULES: usize = 10;

#[derive(Debug, Clone)]
pub struct ForwardRule {
    pub id: u32,
    pub description: String,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub active: bool,
}

struct RunningService {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

pub struct ForwardManager {
    rules: Mutex<Vec<ForwardRule>>,
    running: Mutex<HashMap<u32, RunningService>>,
    engine_running: AtomicBool,
}

impl Default for ForwardManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardManager {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            engine_running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.engine_running.load(Ordering::SeqCst)
    }

    /// Adds a rule. `id` is assigned as `rule_count + 1`; when `description`
    /// is `None` one is synthesized as `Forward <id> -> <host>:<port>`.
    pub async fn add_rule(
        &self,
        listen_port: u16,
        target_host: String,
        target_port: u16,
        description: Option<String>,
    ) -> Result<u32> {
        let mut rules = self.rules.lock().await;
        if rules.len() >= MAX_RULES {
            return Err(ForwardError::TableFull);
        }
        let id = rules.len() as u32 + 1;
        let description = description
            .unwrap_or_else(|| format!("Forward {id} -> {target_host}:{target_port}"));
        rules.push(ForwardRule {
            id,
            description,
            listen_port,
            target_host,
            target_port,
            active: true,
        });
        Ok(id)
    }

    /// Removes a rule by id, stopping its acceptor if running, then
    /// compacts the table and renumbers the remaining rules sequentially
    /// from 1 so ids stay dense (matches the original's array-shift
    /// removal).
    pub async fn remove_rule(&self, id: u32) -> Result<()> {
        self.stop_rule_acceptor(id).await;
        let mut rules = self.rules.lock().await;
        let index = rules
            .iter()
            .position(|r| r.id == id)
            .ok_or(ForwardError::UnknownRule(id))?;
        rules.remove(index);
        for (i, rule) in rules.iter_mut().enumerate() {
            rule.id = i as u32 + 1;
        }
        Ok(())
    }

    /// Enables a rule. If the engine is currently running, also starts an
    /// acceptor for it immediately (§4.4: "Starting an acceptor for a newly
    /// enabled rule while the engine is running is the engine's
    /// responsibility").
    pub async fn enable_rule(self: &Arc<Self>, id: u32) -> Result<()> {
        self.set_active(id, true).await?;
        if self.is_running() {
            let rule = {
                let rules = self.rules.lock().await;
                rules.iter().find(|r| r.id == id).cloned()
            };
            if let Some(rule) = rule {
                if let Err(e) = self.spawn_acceptor(rule).await {
                    warn!(id, error = %e, "failed to start acceptor for newly enabled rule");
                }
            }
        }
        Ok(())
    }

    /// Disables a rule. A running acceptor only re-checks `active` after
    /// accepting a connection (§4.4), so it drains on its own rather than
    /// being torn down here.
    pub async fn disable_rule(&self, id: u32) -> Result<()> {
        self.set_active(id, false).await
    }

    async fn set_active(&self, id: u32, active: bool) -> Result<()> {
        let mut rules = self.rules.lock().await;
        let rule = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(ForwardError::UnknownRule(id))?;
        rule.active = active;
        Ok(())
    }

    pub async fn list_rules(&self) -> Vec<ForwardRule> {
        self.rules.lock().await.clone()
    }

    /// Launches one acceptor per currently-active rule. Idempotent-failure:
    /// returns `AlreadyRunning` if the engine is already started (§4.4).
    /// A bind failure for one rule is logged and skipped; it does not stop
    /// the other rules' acceptors from starting (§4.4: "Binding failures
    /// are fatal for that rule only").
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self
            .engine_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ForwardError::AlreadyRunning);
        }

        let active_rules: Vec<ForwardRule> = self
            .rules
            .lock()
            .await
            .iter()
            .filter(|r| r.active)
            .cloned()
            .collect();

        for rule in active_rules {
            let id = rule.id;
            if let Err(e) = self.spawn_acceptor(rule).await {
                warn!(id, error = %e, "failed to bind listener for rule, skipping");
            }
        }
        Ok(())
    }

    /// Flips the engine's running flag and signals every live acceptor to
    /// drain; acceptors exit at their next accept boundary (§4.4). Waits for
    /// every acceptor task to actually finish before returning, so a caller
    /// that follows `stop()` with process exit doesn't abort an acceptor
    /// mid-iteration. In-flight spliced connections are left alone and close
    /// on their own sockets.
    pub async fn stop(&self) {
        self.engine_running.store(false, Ordering::SeqCst);
        let services: Vec<RunningService> = {
            let mut running = self.running.lock().await;
            running.drain().map(|(_, service)| service).collect()
        };
        for service in services {
            service.stop.store(true, Ordering::SeqCst);
            let _ = service.handle.await;
        }
    }

    /// Binds `rule.listen_port` and spawns its acceptor task. Used both by
    /// `start()` (for every active rule) and by `enable_rule` (for a single
    /// rule enabled while the engine is already running).
    async fn spawn_acceptor(self: &Arc<Self>, rule: ForwardRule) -> Result<()> {
        let id = rule.id;
        {
            let running = self.running.lock().await;
            if running.contains_key(&id) {
                return Ok(());
            }
        }

        let listener = TcpListener::bind(("0.0.0.0", rule.listen_port)).await?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let manager = self.clone();

        let handle = tokio::spawn(async move {
            info!(id, listen_port = rule.listen_port, "forward acceptor started");
            loop {
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                let (conn, peer) = tokio::select! {
                    res = listener.accept() => match res {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(id, error = %e, "accept failed");
                            continue;
                        }
                    },
                    _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => continue,
                };

                let still_active = manager
                    .rules
                    .lock()
                    .await
                    .iter()
                    .find(|r| r.id == id)
                    .map(|r| r.active)
                    .unwrap_or(false);
                if !still_active {
                    debug!(id, "rule disabled, draining acceptor");
                    break;
                }

                debug!(id, %peer, "accepted forward connection");
                let target_host = rule.target_host.clone();
                let target_port = rule.target_port;
                tokio::spawn(async move {
                    if let Err(e) = forward_one(conn, target_host, target_port).await {
                        warn!(error = %e, "forward connection failed");
                    }
                });
            }
            manager.running.lock().await.remove(&id);
            info!(id, "forward acceptor stopped");
        });

        self.running
            .lock()
            .await
            .insert(id, RunningService { handle, stop });
        Ok(())
    }

    async fn stop_rule_acceptor(&self, id: u32) {
        if let Some(service) = self.running.lock().await.remove(&id) {
            service.stop.store(true, Ordering::SeqCst);
            service.handle.abort();
        }
    }

    /// Writes the rule table to `path` in the flat config format: a
    /// `#`-prefixed header comment followed by one whitespace-delimited
    /// line per rule (`listen_port target_host target_port description`).
    pub async fn save_config(&self, path: &std::path::Path) -> Result<()> {
        let rules = self.rules.lock().await;
        let mut out = String::from("# Port Forwarding Configuration\n# Format: listen_port target_host target_port [description]\n");
        for rule in rules.iter() {
            out.push_str(&format!(
                "{} {} {} {}\n",
                rule.listen_port, rule.target_host, rule.target_port, rule.description
            ));
        }
        tokio::fs::write(path, out).await?;
        Ok(())
    }

    /// Loads rules from `path`, replacing the current table. Lines
    /// starting with `#` are comments; a line may have 3 fields
    /// (`listen_port target_host target_port`, description synthesized) or
    /// 4+ (trailing whitespace-separated words joined back into the
    /// description), matching the original parser's tolerance.
    pub async fn load_config(&self, path: &std::path::Path) -> Result<()> {
        let contents = tokio::fs::read_to_string(path).await?;
        let mut loaded = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let listen_port: u16 = parts
                .next()
                .ok_or_else(|| ForwardError::Config {
                    line: lineno + 1,
                    reason: "missing listen_port".to_string(),
                })?
                .parse()
                .map_err(|_| ForwardError::Config {
                    line: lineno + 1,
                    reason: "invalid listen_port".to_string(),
                })?;
            let target_host = parts
                .next()
                .ok_or_else(|| ForwardError::Config {
                    line: lineno + 1,
                    reason: "missing target_host".to_string(),
                })?
                .to_string();
            let target_port: u16 = parts
                .next()
                .ok_or_else(|| ForwardError::Config {
                    line: lineno + 1,
                    reason: "missing target_port".to_string(),
                })?
                .parse()
                .map_err(|_| ForwardError::Config {
                    line: lineno + 1,
                    reason: "invalid target_port".to_string(),
                })?;
            let rest: Vec<&str> = parts.collect();
            let id = loaded.len() as u32 + 1;
            let description = if rest.is_empty() {
                format!("Forward {id} -> {target_host}:{target_port}")
            } else {
                rest.join(" ")
            };
            loaded.push(ForwardRule {
                id,
                description,
                listen_port,
                target_host,
                target_port,
                active: true,
            });
        }
        *self.rules.lock().await = loaded;
        Ok(())
    }
}

/// Connects to `target_host:target_port` and splices bytes both ways with
/// the accepted connection until either side closes.
async fn forward_one(mut conn: TcpStream, target_host: String, target_port: u16) -> Result<()> {
    let mut target = TcpStream::connect((target_host.as_str(), target_port)).await?;
    let (mut in_r, mut in_w) = conn.split();
    let (mut out_r, mut out_w) = target.split();

    let to_target = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = match in_r.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if n == 0 || out_w.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = out_w.shutdown().await;
    };
    let to_source = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = match out_r.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if n == 0 || in_w.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = in_w.shutdown().await;
    };
    tokio::join!(to_target, to_source);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_rule_synthesizes_description() {
        let mgr = ForwardManager::new();
        let id = mgr
            .add_rule(8080, "localhost".to_string(), 80, None)
            .await
            .unwrap();
        let rules = mgr.list_rules().await;
        assert_eq!(rules[0].id, id);
        assert_eq!(rules[0].description, "Forward 1 -> localhost:80");
    }

    #[tokio::test]
    async fn add_rule_keeps_given_description() {
        let mgr = ForwardManager::new();
        mgr.add_rule(8080, "localhost".to_string(), 80, Some("web".to_string()))
            .await
            .unwrap();
        let rules = mgr.list_rules().await;
        assert_eq!(rules[0].description, "web");
    }

    #[tokio::test]
    async fn remove_rule_compacts_and_renumbers() {
        let mgr = ForwardManager::new();
        mgr.add_rule(1, "a".to_string(), 1, None).await.unwrap();
        mgr.add_rule(2, "b".to_string(), 2, None).await.unwrap();
        mgr.add_rule(3, "c".to_string(), 3, None).await.unwrap();

        mgr.remove_rule(2).await.unwrap();

        let rules = mgr.list_rules().await;
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, 1);
        assert_eq!(rules[0].listen_port, 1);
        assert_eq!(rules[1].id, 2);
        assert_eq!(rules[1].listen_port, 3);
    }

    #[tokio::test]
    async fn remove_last_rule_then_readd_reuses_id_one() {
        let mgr = ForwardManager::new();
        mgr.add_rule(8080, "a".to_string(), 1, None).await.unwrap();
        mgr.remove_rule(1).await.unwrap();
        assert_eq!(mgr.list_rules().await.len(), 0);
        let id = mgr.add_rule(8080, "a".to_string(), 1, None).await.unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn remove_unknown_rule_errors() {
        let mgr = ForwardManager::new();
        assert!(matches!(
            mgr.remove_rule(99).await,
            Err(ForwardError::UnknownRule(99))
        ));
    }

    #[tokio::test]
    async fn table_full_rejects_further_adds() {
        let mgr = ForwardManager::new();
        for i in 0..MAX_RULES {
            mgr.add_rule(i as u16 + 1, "h".to_string(), 1, None)
                .await
                .unwrap();
        }
        assert!(matches!(
            mgr.add_rule(9999, "h".to_string(), 1, None).await,
            Err(ForwardError::TableFull)
        ));
    }

    #[tokio::test]
    async fn added_rule_is_active_by_default() {
        let mgr = ForwardManager::new();
        mgr.add_rule(1, "h".to_string(), 1, None).await.unwrap();
        assert!(mgr.list_rules().await[0].active);
    }

    #[tokio::test]
    async fn enable_disable_toggles_active_flag() {
        let mgr = Arc::new(ForwardManager::new());
        let id = mgr.add_rule(1, "h".to_string(), 1, None).await.unwrap();
        assert!(mgr.list_rules().await[0].active);
        mgr.disable_rule(id).await.unwrap();
        assert!(!mgr.list_rules().await[0].active);
        mgr.enable_rule(id).await.unwrap();
        assert!(mgr.list_rules().await[0].active);
    }

    #[tokio::test]
    async fn start_is_idempotent_failure_when_already_running() {
        let mgr = Arc::new(ForwardManager::new());
        mgr.start().await.unwrap();
        assert!(matches!(mgr.start().await, Err(ForwardError::AlreadyRunning)));
        mgr.stop().await;
    }

    #[tokio::test]
    async fn start_skips_inactive_rules() {
        let mgr = Arc::new(ForwardManager::new());
        let id = mgr.add_rule(0, "127.0.0.1".to_string(), 1, None).await.unwrap();
        mgr.disable_rule(id).await.unwrap();
        mgr.start().await.unwrap();
        assert!(mgr.running.lock().await.is_empty());
        mgr.stop().await;
    }

    #[tokio::test]
    async fn stop_clears_running_flag_and_acceptors() {
        let mgr = Arc::new(ForwardManager::new());
        mgr.start().await.unwrap();
        assert!(mgr.is_running());
        mgr.stop().await;
        assert!(!mgr.is_running());
        assert!(mgr.running.lock().await.is_empty());
    }
}
