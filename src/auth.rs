// Credential store: persists one login/secret pair per server host in the
// user's netrc file (`~/.netrc`, `_netrc` on Windows). The file is shared
// with other tools, so the parser keeps every record it does not own —
// entries for other hosts, `default` entries, `macdef` blocks — and writes
// them back untouched.
//
// The grammar is the classic line-oriented netrc one:
//
//     machine <host>
//         login <login>
//         [account <account>]
//         password <secret>
//
// Values are single whitespace-delimited tokens and are stored exactly as
// given: no quoting is ever added or stripped, so a secret containing
// literal quote characters round-trips byte-for-byte.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ClientError, Result};

/// A (login, secret) pair loaded from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub secret: String,
}

/// One record of the secrets file. `machine` is `None` for a `default`
/// entry. Fields other tools may have left partially filled are kept as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Entry {
    machine: Option<String>,
    login: Option<String>,
    account: Option<String>,
    password: Option<String>,
}

/// A `macdef` block. The body is opaque to us and preserved verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Macro {
    name: String,
    body: Vec<String>,
}

/// Parsed form of the whole secrets file, in original order.
#[derive(Debug, Default, PartialEq, Eq)]
struct SecretsFile {
    entries: Vec<Entry>,
    macros: Vec<Macro>,
}

impl SecretsFile {
    fn parse(text: &str) -> Result<SecretsFile> {
        let mut file = SecretsFile::default();
        let mut current: Option<Entry> = None;
        // A keyword whose value has not been seen yet. Values may sit on
        // the next line, so this carries across line boundaries.
        let mut pending: Option<&'static str> = None;

        let lines: Vec<&str> = text.lines().collect();
        let mut i = 0;
        'lines: while i < lines.len() {
            let mut words = lines[i].split_whitespace();
            while let Some(word) = words.next() {
                if let Some(key) = pending.take() {
                    if key == "macdef" {
                        // The macro body is every following line up to the
                        // first blank one.
                        let start = i + 1;
                        let mut end = start;
                        while end < lines.len() && !lines[end].trim().is_empty() {
                            end += 1;
                        }
                        file.macros.push(Macro {
                            name: word.to_string(),
                            body: lines[start..end].iter().map(|l| l.to_string()).collect(),
                        });
                        i = end + 1;
                        continue 'lines;
                    }
                    apply(&mut file, &mut current, key, word)?;
                    continue;
                }
                match word {
                    "machine" | "login" | "account" | "password" => {
                        pending = Some(keyword(word));
                    }
                    "macdef" => pending = Some("macdef"),
                    "default" => {
                        if let Some(done) = current.take() {
                            file.entries.push(done);
                        }
                        current = Some(Entry::default());
                    }
                    other => {
                        return Err(ClientError::Parse(format!(
                            "unexpected token {other:?}"
                        )))
                    }
                }
            }
            i += 1;
        }

        if let Some(key) = pending {
            return Err(ClientError::Parse(format!("`{key}` is missing a value")));
        }
        if let Some(done) = current.take() {
            file.entries.push(done);
        }
        Ok(file)
    }

    fn to_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match &entry.machine {
                Some(machine) => {
                    out.push_str("machine ");
                    out.push_str(machine);
                    out.push('\n');
                }
                None => out.push_str("default\n"),
            }
            if let Some(login) = &entry.login {
                out.push_str("\tlogin ");
                out.push_str(login);
                out.push('\n');
            }
            if let Some(account) = &entry.account {
                out.push_str("\taccount ");
                out.push_str(account);
                out.push('\n');
            }
            if let Some(password) = &entry.password {
                out.push_str("\tpassword ");
                out.push_str(password);
                out.push('\n');
            }
        }
        for mac in &self.macros {
            out.push_str("macdef ");
            out.push_str(&mac.name);
            out.push('\n');
            for line in &mac.body {
                out.push_str(line);
                out.push('\n');
            }
            // A blank line terminates the macro body.
            out.push('\n');
        }
        out
    }

    fn find(&self, host: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.machine.as_deref() == Some(host))
    }

    fn upsert(&mut self, host: &str, login: &str, secret: &str) {
        let fresh = Entry {
            machine: Some(host.to_string()),
            login: Some(login.to_string()),
            account: None,
            password: Some(secret.to_string()),
        };
        match self
            .entries
            .iter_mut()
            .find(|e| e.machine.as_deref() == Some(host))
        {
            Some(entry) => *entry = fresh,
            None => self.entries.push(fresh),
        }
    }
}

// Interns keyword tokens so `pending` can be a `&'static str`.
fn keyword(word: &str) -> &'static str {
    match word {
        "machine" => "machine",
        "login" => "login",
        "account" => "account",
        "password" => "password",
        other => unreachable!("not a keyword: {other}"),
    }
}

fn apply(
    file: &mut SecretsFile,
    current: &mut Option<Entry>,
    key: &'static str,
    value: &str,
) -> Result<()> {
    if key == "machine" {
        if let Some(done) = current.take() {
            file.entries.push(done);
        }
        *current = Some(Entry {
            machine: Some(value.to_string()),
            ..Entry::default()
        });
        return Ok(());
    }
    let entry = current
        .as_mut()
        .ok_or_else(|| ClientError::Parse(format!("`{key}` before any machine entry")))?;
    let value = Some(value.to_string());
    match key {
        "login" => entry.login = value,
        "account" => entry.account = value,
        "password" => entry.password = value,
        _ => unreachable!(),
    }
    Ok(())
}

/// Handle on the secrets file at a fixed per-user location.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// The store at its conventional location in the home directory.
    pub fn open_default() -> Result<CredentialStore> {
        let home = dirs::home_dir()
            .ok_or_else(|| ClientError::Config("could not determine the home directory".into()))?;
        let name = if cfg!(windows) { "_netrc" } else { ".netrc" };
        Ok(CredentialStore {
            path: home.join(name),
        })
    }

    /// A store backed by an arbitrary file.
    pub fn at(path: impl Into<PathBuf>) -> CredentialStore {
        CredentialStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the backing file if it is absent, restricting it to
    /// owner-read/write. A pre-existing file is left untouched, including
    /// its permissions.
    pub fn ensure_exists(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        fs::File::create(&self.path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        debug!(path = %self.path.display(), "created secrets file");
        Ok(())
    }

    /// The credentials stored for `host`, if any. A missing entry is not
    /// an error; a malformed or unreadable file is.
    pub fn load(&self, host: &str) -> Result<Option<Credentials>> {
        let file = self.read()?;
        Ok(file.find(host).and_then(|e| match (&e.login, &e.password) {
            (Some(login), Some(password)) => Some(Credentials {
                login: login.clone(),
                secret: password.clone(),
            }),
            _ => None,
        }))
    }

    /// Inserts or replaces the entry for `host` and rewrites the file,
    /// leaving every other record exactly as it was.
    pub fn save(&self, host: &str, login: &str, secret: &str) -> Result<()> {
        let mut file = self.read()?;
        file.upsert(host, login, secret);
        self.write(&file)?;
        debug!(host, "saved credentials");
        Ok(())
    }

    /// Removes the entry for `host`, if present, leaving all other
    /// records intact.
    pub fn clear(&self, host: &str) -> Result<()> {
        let mut file = self.read()?;
        file.entries.retain(|e| e.machine.as_deref() != Some(host));
        self.write(&file)?;
        debug!(host, "cleared credentials");
        Ok(())
    }

    fn read(&self) -> Result<SecretsFile> {
        self.ensure_exists()?;
        let text = fs::read_to_string(&self.path)?;
        SecretsFile::parse(&text)
    }

    // Full rewrite through a sibling temp file so readers never observe a
    // half-written store. Concurrent writers race; last one wins.
    fn write(&self, file: &SecretsFile) -> Result<()> {
        let mut tmp_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);
        fs::write(&tmp, file.to_text())?;
        #[cfg(unix)]
        if let Ok(meta) = fs::metadata(&self.path) {
            fs::set_permissions(&tmp, meta.permissions())?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    struct Scratch {
        store: CredentialStore,
    }

    impl Scratch {
        fn new() -> Scratch {
            let path = std::env::temp_dir().join(format!(
                "skiff-netrc-test-{}-{}",
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::SeqCst)
            ));
            Scratch {
                store: CredentialStore::at(path),
            }
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            let _ = fs::remove_file(self.store.path());
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let s = Scratch::new();
        s.store
            .save("api.example.com", "user@test.com", "tok123")
            .unwrap();
        let creds = s.store.load("api.example.com").unwrap().unwrap();
        assert_eq!(creds.login, "user@test.com");
        assert_eq!(creds.secret, "tok123");
    }

    #[test]
    fn quote_characters_round_trip_exactly() {
        let s = Scratch::new();
        s.store
            .save("api.example.com", "'user@test.com'", "'auth_token'")
            .unwrap();
        let creds = s.store.load("api.example.com").unwrap().unwrap();
        assert_eq!(creds.login, "'user@test.com'");
        assert_eq!(creds.secret, "'auth_token'");

        // The file itself must carry the values untouched as well.
        let text = fs::read_to_string(s.store.path()).unwrap();
        assert!(text.contains("login 'user@test.com'"));
        assert!(text.contains("password 'auth_token'"));
    }

    #[test]
    fn missing_host_is_none_not_an_error() {
        let s = Scratch::new();
        assert_eq!(s.store.load("nowhere.example.com").unwrap(), None);
    }

    #[test]
    fn saving_one_host_leaves_others_alone() {
        let s = Scratch::new();
        s.store.save("a.example.com", "alice", "s1").unwrap();
        s.store.save("b.example.com", "bob", "s2").unwrap();
        let a = s.store.load("a.example.com").unwrap().unwrap();
        assert_eq!(a.login, "alice");
        assert_eq!(a.secret, "s1");
        let b = s.store.load("b.example.com").unwrap().unwrap();
        assert_eq!(b.login, "bob");
    }

    #[test]
    fn relogin_overwrites_the_entry() {
        let s = Scratch::new();
        s.store.save("a.example.com", "alice", "old").unwrap();
        s.store.save("a.example.com", "alice", "new").unwrap();
        let creds = s.store.load("a.example.com").unwrap().unwrap();
        assert_eq!(creds.secret, "new");

        let text = fs::read_to_string(s.store.path()).unwrap();
        assert_eq!(text.matches("machine a.example.com").count(), 1);
    }

    #[test]
    fn clear_removes_only_the_target_host() {
        let s = Scratch::new();
        s.store.save("a.example.com", "alice", "s1").unwrap();
        s.store.save("b.example.com", "bob", "s2").unwrap();
        s.store.clear("a.example.com").unwrap();
        assert_eq!(s.store.load("a.example.com").unwrap(), None);
        assert!(s.store.load("b.example.com").unwrap().is_some());
    }

    #[test]
    fn ensure_exists_is_idempotent() {
        let s = Scratch::new();
        s.store.ensure_exists().unwrap();
        s.store.save("a.example.com", "alice", "s1").unwrap();
        s.store.ensure_exists().unwrap();
        // A second ensure must not truncate the populated file.
        assert!(s.store.load("a.example.com").unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn created_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let s = Scratch::new();
        s.store.ensure_exists().unwrap();
        let mode = fs::metadata(s.store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn foreign_records_survive_a_rewrite() {
        let s = Scratch::new();
        let existing = "machine other.example.com\n\
                        \tlogin carol\n\
                        \taccount work\n\
                        \tpassword hunter2\n\
                        default\n\
                        \tlogin anonymous\n\
                        macdef init\n\
                        cd /upload\n\
                        put report.txt\n\
                        \n";
        fs::write(s.store.path(), existing).unwrap();

        s.store.save("api.example.com", "alice", "tok").unwrap();
        let text = fs::read_to_string(s.store.path()).unwrap();

        assert!(text.contains("machine other.example.com"));
        assert!(text.contains("\taccount work"));
        assert!(text.contains("\tpassword hunter2"));
        assert!(text.contains("default\n\tlogin anonymous"));
        assert!(text.contains("macdef init\ncd /upload\nput report.txt\n\n"));
        assert!(text.contains("machine api.example.com"));
    }

    #[test]
    fn single_line_records_parse() {
        let parsed =
            SecretsFile::parse("machine h.example.com login alice password pw\n").unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].login.as_deref(), Some("alice"));
        assert_eq!(parsed.entries[0].password.as_deref(), Some("pw"));
    }

    #[test]
    fn value_may_continue_on_the_next_line() {
        let parsed = SecretsFile::parse("machine\nh.example.com\nlogin alice\n").unwrap();
        assert_eq!(
            parsed.entries[0].machine.as_deref(),
            Some("h.example.com")
        );
    }

    #[test]
    fn malformed_content_is_a_parse_error() {
        let s = Scratch::new();
        fs::write(s.store.path(), "machine\n").unwrap();
        assert!(matches!(
            s.store.load("h"),
            Err(ClientError::Parse(_))
        ));

        fs::write(s.store.path(), "garbage here\n").unwrap();
        assert!(matches!(
            s.store.load("h"),
            Err(ClientError::Parse(_))
        ));

        fs::write(s.store.path(), "login orphan\n").unwrap();
        assert!(matches!(
            s.store.load("h"),
            Err(ClientError::Parse(_))
        ));
    }

    #[test]
    fn parse_serialize_parse_is_stable() {
        let input = "machine a.example.com\n\
                     \tlogin alice\n\
                     \tpassword s1\n\
                     machine b.example.com\n\
                     \tlogin bob\n\
                     \tpassword s2\n";
        let once = SecretsFile::parse(input).unwrap();
        let twice = SecretsFile::parse(&once.to_text()).unwrap();
        assert_eq!(once, twice);
    }
}
