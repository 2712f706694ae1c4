//! Cross-process session registry.
//!
//! Every running gateway registers itself in a shared JSON file under the
//! per-user state directory. All mutations are read-modify-write cycles
//! under an exclusive OS file lock; there is no in-memory coordination
//! between processes. Dead entries are reaped on every touch: an entry is
//! dead when its PID is gone, or when its process was reparented to init
//! (its editor exited and left it orphaned).

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::catalog;
use crate::{Error, Result};

/// One live process's identity row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub name: String,
    pub voice: String,
    pub port: u16,
    pub pid: u32,
    /// Logical editor session id, filled in by the `/session` endpoint
    pub session_id: Option<String>,
    /// Terminal multiplexer session bound to this process
    pub tmux_session: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionsFile {
    sessions: Vec<SessionEntry>,
}

/// Handle on the shared sessions file
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Run one read-modify-write cycle under the file lock.
    fn with_locked<T>(&self, f: impl FnOnce(&mut Vec<SessionEntry>) -> T) -> Result<T> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| Error::Registry(format!("cannot open {}: {e}", self.path.display())))?;
        file.lock_exclusive()
            .map_err(|e| Error::Registry(format!("cannot lock {}: {e}", self.path.display())))?;

        let result = (|| -> Result<T> {
            let mut raw = String::new();
            file.read_to_string(&mut raw)?;
            let mut sessions = serde_json::from_str::<SessionsFile>(&raw)
                .map(|f| f.sessions)
                .unwrap_or_default();

            let out = f(&mut sessions);

            let raw = serde_json::to_string_pretty(&SessionsFile { sessions })?;
            file.seek(SeekFrom::Start(0))?;
            file.set_len(0)?;
            file.write_all(raw.as_bytes())?;
            Ok(out)
        })();

        let _ = FileExt::unlock(&file);
        result
    }

    /// Register this process, reconciling against other live entries.
    ///
    /// Claims the preferred name if free, otherwise the next available
    /// identity from the catalogue priority order. When the preferred name
    /// is taken, waits briefly and retries once: the holder may be an old
    /// server mid-shutdown.
    ///
    /// # Errors
    ///
    /// Fatal when the registry file cannot be locked or written: the
    /// process cannot operate without an identity.
    pub fn register(
        &self,
        preferred_name: &str,
        preferred_voice: &str,
        base_port: u16,
        pid: u32,
        tmux_session: Option<String>,
    ) -> Result<SessionEntry> {
        let taken = self.with_locked(|sessions| {
            clean_stale(sessions, pid);
            sessions.iter().any(|s| s.name == preferred_name)
        })?;

        if taken {
            std::thread::sleep(Duration::from_secs(2));
        }

        self.with_locked(|sessions| {
            clean_stale(sessions, pid);

            let taken_names: Vec<String> = sessions.iter().map(|s| s.name.clone()).collect();
            let taken_voices: Vec<String> = sessions.iter().map(|s| s.voice.clone()).collect();

            let (name, voice) =
                choose_identity(preferred_name, preferred_voice, &taken_names, &taken_voices);
            if name != preferred_name {
                tracing::warn!(
                    preferred = %preferred_name,
                    assigned = %name,
                    voice = %voice,
                    "preferred name already active"
                );
            }

            let port = lowest_free_port(sessions, base_port);
            let entry = SessionEntry {
                name,
                voice,
                port,
                pid,
                session_id: None,
                tmux_session,
                started_at: Utc::now(),
            };
            sessions.push(entry.clone());
            tracing::info!(name = %entry.name, voice = %entry.voice, port, "session registered");
            entry
        })
    }

    /// Remove this process's entry.
    ///
    /// # Errors
    ///
    /// Returns error if the registry file cannot be locked.
    pub fn unregister(&self, pid: u32) -> Result<()> {
        self.with_locked(|sessions| {
            sessions.retain(|s| s.pid != pid);
        })?;
        tracing::info!("session unregistered");
        Ok(())
    }

    /// Stamp the logical session id on this process's entry and reconcile
    /// with siblings: if a live entry already carries the same id, adopt
    /// its name and voice (shared session = shared identity). Idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if the registry file cannot be locked.
    pub fn attach_session_id(&self, pid: u32, session_id: &str) -> Result<Option<SessionEntry>> {
        self.with_locked(|sessions| {
            clean_stale(sessions, pid);

            let sibling = sessions
                .iter()
                .find(|s| {
                    s.pid != pid && s.session_id.as_deref() == Some(session_id)
                })
                .map(|s| (s.name.clone(), s.voice.clone()));

            let own = sessions.iter_mut().find(|s| s.pid == pid)?;
            own.session_id = Some(session_id.to_string());

            if let Some((name, voice)) = sibling {
                if own.name != name {
                    tracing::info!(
                        from = %own.name,
                        to = %name,
                        session_id,
                        "adopting sibling identity"
                    );
                    own.name = name;
                    own.voice = voice;
                }
            }
            Some(own.clone())
        })
    }

    /// Rename this process's entry (and optionally change its voice).
    ///
    /// # Errors
    ///
    /// Returns `NameOccupied` when another live entry outside this entry's
    /// sibling group already holds `new_name`.
    pub fn rename(
        &self,
        pid: u32,
        new_name: &str,
        new_voice: Option<&str>,
    ) -> Result<SessionEntry> {
        self.with_locked(|sessions| {
            clean_stale(sessions, pid);

            let own_session_id = sessions
                .iter()
                .find(|s| s.pid == pid)
                .and_then(|s| s.session_id.clone());

            if let Some(holder) = sessions.iter().find(|s| {
                s.pid != pid
                    && s.name == new_name
                    && (s.session_id.is_none() || s.session_id != own_session_id)
            }) {
                return Err(Error::NameOccupied {
                    name: new_name.to_string(),
                    holder: holder.name.clone(),
                });
            }

            let own = sessions
                .iter_mut()
                .find(|s| s.pid == pid)
                .ok_or_else(|| Error::Registry("own entry missing".to_string()))?;
            own.name = new_name.to_string();
            if let Some(voice) = new_voice {
                own.voice = voice.to_string();
            }
            Ok(own.clone())
        })?
    }

    /// Remove dead entries plus any the caller has independently judged
    /// stale (e.g. HTTP side-channel silent past the orphan threshold).
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns error if the registry file cannot be locked.
    pub fn sweep(&self, own_pid: u32, also_remove: &[u32]) -> Result<usize> {
        self.with_locked(|sessions| {
            let before = sessions.len();
            clean_stale(sessions, own_pid);
            sessions.retain(|s| s.pid == own_pid || !also_remove.contains(&s.pid));
            before - sessions.len()
        })
    }

    /// Current live set, after an inline sweep of dead PIDs.
    ///
    /// # Errors
    ///
    /// Returns error if the registry file cannot be locked.
    pub fn snapshot(&self, own_pid: u32) -> Result<Vec<SessionEntry>> {
        self.with_locked(|sessions| {
            clean_stale(sessions, own_pid);
            sessions.clone()
        })
    }
}

/// Pick `(name, voice)` for a registering process. Preferred name when
/// free; otherwise the first catalogue-priority identity whose name and
/// voice are both unclaimed.
fn choose_identity(
    preferred_name: &str,
    preferred_voice: &str,
    taken_names: &[String],
    taken_voices: &[String],
) -> (String, String) {
    let name_taken = |n: &str| taken_names.iter().any(|t| t == n);
    let voice_taken = |v: &str| taken_voices.iter().any(|t| t == v);

    if !name_taken(preferred_name) {
        let voice = catalog::voice_for_name(preferred_name)
            .map(str::to_string)
            .unwrap_or_else(|| preferred_voice.to_string());
        return (preferred_name.to_string(), voice);
    }

    for (name_lower, voice) in catalog::NAME_PRIORITY {
        let name = capitalize(name_lower);
        if !name_taken(&name) && !voice_taken(voice) {
            return (name, (*voice).to_string());
        }
    }

    // Every priority identity taken; keep the preferred name and let the
    // caller live with the duplicate voice.
    (preferred_name.to_string(), preferred_voice.to_string())
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().collect::<String>() + chars.as_str()
    })
}

fn lowest_free_port(sessions: &[SessionEntry], base_port: u16) -> u16 {
    let mut port = base_port;
    while sessions.iter().any(|s| s.port == port) {
        port += 1;
    }
    port
}

/// Drop entries whose process is dead or orphaned. `own_pid` is always
/// considered healthy.
fn clean_stale(sessions: &mut Vec<SessionEntry>, own_pid: u32) {
    sessions.retain(|s| {
        let healthy = s.pid == own_pid || session_healthy(s);
        if !healthy {
            tracing::info!(name = %s.name, pid = s.pid, "removed stale session");
        }
        healthy
    });
}

fn session_healthy(entry: &SessionEntry) -> bool {
    if !pid_alive(entry.pid) {
        return false;
    }

    // A server whose parent died is reparented to init; its editor is gone.
    if let Some(ppid) = parent_pid(entry.pid) {
        if ppid <= 1 {
            tracing::info!(
                name = %entry.name,
                pid = entry.pid,
                ppid,
                "session orphaned, terminating"
            );
            if let Ok(pid) = libc::pid_t::try_from(entry.pid) {
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
            }
            return false;
        }
    }
    true
}

/// `kill(pid, 0)` liveness probe; EPERM still means the process exists.
fn pid_alive(pid: u32) -> bool {
    // Zero and out-of-range values would address process groups.
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        true
    } else {
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

fn parent_pid(pid: u32) -> Option<u32> {
    let output = Command::new("ps")
        .args(["-o", "ppid=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}
