//! The bundle store: SQLite-backed tables for manifests, content-addressed
//! payload blobs, and the group relation that gives bundles their effective
//! priority. Adds are transactional; a newer version of a bundle replaces
//! the older atomically, and `make_space` evicts strictly lower-priority
//! files (largest first) when the configured space would be exceeded.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::bar::Bar;
use crate::config;
use crate::cursor::SyncCursor;
use crate::error::RhizomeError;
use crate::manifest::Manifest;

pub const PRIORITY_NOTINTERESTED: i64 = 0;
pub const PRIORITY_BULK: i64 = 1;
pub const PRIORITY_DEFAULT: i64 = 2;
pub const PRIORITY_OPTIONAL: i64 = 3;
pub const PRIORITY_SUBSCRIBED: i64 = 4;
pub const PRIORITY_CORE: i64 = 5;

/// Headroom the store keeps free below its configured space.
const SPACE_RESERVE: u64 = 64 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddOutcome {
    /// First version of this bundle id seen here.
    New,
    /// Replaced a stored older version.
    Replaced,
}

pub struct RhizomeStore {
    conn: Connection,
    space: u64,
}

impl RhizomeStore {
    /// Open (or create) the store in an instance directory holding
    /// `rhizome.db` and `rhizome.conf`.
    pub fn open(dir: &Path) -> Result<Self, RhizomeError> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("rhizome.db"))?;
        let store = Self { conn, space: config::read_space_conf(dir) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory(space: u64) -> Result<Self, RhizomeError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn, space };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), RhizomeError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS MANIFESTS(
                id TEXT PRIMARY KEY,
                manifest BLOB NOT NULL,
                version INTEGER NOT NULL,
                privatekey BLOB
            );
            CREATE TABLE IF NOT EXISTS FILES(
                id TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                length INTEGER NOT NULL,
                highestpriority INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS FILEMANIFESTS(
                fileid TEXT NOT NULL,
                manifestid TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS MANIFESTGROUPS(
                manifestid TEXT NOT NULL,
                groupid TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS GROUPS(
                id TEXT PRIMARY KEY,
                priority INTEGER NOT NULL,
                manifest BLOB,
                groupsecret BLOB
            );",
        )?;
        Ok(())
    }

    pub fn space(&self) -> u64 {
        self.space
    }

    pub fn set_space(&mut self, space: u64) {
        self.space = space;
    }

    /// Bytes the database currently occupies, from page accounting.
    pub fn used(&self) -> Result<u64, RhizomeError> {
        let page_size: i64 = self.conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        let page_count: i64 = self.conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let free_count: i64 =
            self.conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
        Ok((page_size * (page_count - free_count)).max(0) as u64)
    }

    /// Validate and store a bundle. The payload may be omitted when the
    /// blob is already present (matched by `filehash`).
    pub fn add_bundle(
        &mut self,
        manifest: &Manifest,
        payload: Option<&[u8]>,
        priority: i64,
    ) -> Result<AddOutcome, RhizomeError> {
        manifest.verify()?;
        manifest.check_sanity()?;
        let id = manifest.id()?.to_hex();
        let version = manifest
            .version()
            .ok_or_else(|| RhizomeError::Validation("manifest missing \"version\" field".into()))?;
        let filesize = manifest.filesize().unwrap_or(0);
        let filehash = manifest.filehash().map(|hash| hash.to_ascii_uppercase());

        let mut have_blob = false;
        if filesize > 0 {
            let hash = filehash.as_deref().ok_or_else(|| {
                RhizomeError::Validation("manifest missing \"filehash\" field".into())
            })?;
            have_blob = self.payload_length(hash)?.is_some();
            match payload {
                Some(bytes) => manifest.verify_payload(bytes)?,
                None if have_blob => {}
                None => {
                    return Err(RhizomeError::Validation(
                        "payload missing and not already stored".into(),
                    ))
                }
            }
        }

        let outcome = match self.manifest_version(&id)? {
            Some(stored) if stored > version => return Err(RhizomeError::Stale),
            Some(stored) if stored == version => return Err(RhizomeError::AlreadyPresent),
            Some(_) => AddOutcome::Replaced,
            None => AddOutcome::New,
        };

        if filesize > 0 && !have_blob {
            self.make_space(priority, filesize)?;
        }

        let manifest_bytes = manifest.to_bytes();
        let secret = manifest.secret().map(|secret| secret.to_vec());
        let group_id = format!("class-{priority}");

        let tx = self.conn.transaction()?;
        // drop the replaced version's relations, then collect its orphans
        let old_files: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT fileid FROM FILEMANIFESTS WHERE manifestid = ?1")?;
            let rows = stmt.query_map(params![id], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        tx.execute("DELETE FROM FILEMANIFESTS WHERE manifestid = ?1", params![id])?;
        tx.execute("DELETE FROM MANIFESTGROUPS WHERE manifestid = ?1", params![id])?;

        tx.execute(
            "INSERT OR REPLACE INTO MANIFESTS (id, manifest, version, privatekey)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, manifest_bytes, version as i64, secret],
        )?;
        if filesize > 0 {
            let hash = filehash.as_deref().unwrap_or_default();
            tx.execute(
                "INSERT INTO FILES (id, data, length, highestpriority)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE
                 SET highestpriority = MAX(highestpriority, excluded.highestpriority)",
                params![hash, payload.unwrap_or_default(), filesize as i64, priority],
            )?;
            tx.execute(
                "INSERT INTO FILEMANIFESTS (fileid, manifestid) VALUES (?1, ?2)",
                params![hash, id],
            )?;
        }
        tx.execute(
            "INSERT OR IGNORE INTO GROUPS (id, priority) VALUES (?1, ?2)",
            params![group_id, priority],
        )?;
        tx.execute(
            "INSERT INTO MANIFESTGROUPS (manifestid, groupid) VALUES (?1, ?2)",
            params![id, group_id],
        )?;
        for old in old_files {
            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM FILEMANIFESTS WHERE fileid = ?1",
                params![old],
                |row| row.get(0),
            )?;
            if remaining == 0 {
                tx.execute("DELETE FROM FILES WHERE id = ?1", params![old])?;
            }
        }
        tx.commit()?;

        log::info!(
            "rz: ADD MANIFEST service={} bid={} version={version}",
            manifest.service().unwrap_or("NULL"),
            id
        );
        Ok(outcome)
    }

    /// Ensure `needed` more bytes fit under the configured space, evicting
    /// strictly lower-priority files, largest first. Never touches a file
    /// whose effective priority is at or above the requested priority.
    fn make_space(&mut self, priority: i64, needed: u64) -> Result<(), RhizomeError> {
        if self.fits(needed)? {
            return Ok(());
        }
        let candidates: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT id FROM FILES WHERE highestpriority < ?1 ORDER BY length DESC",
            )?;
            let rows = stmt.query_map(params![priority], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for fileid in candidates {
            self.drop_stored_file(&fileid, priority + 1)?;
            if self.fits(needed)? {
                return Ok(());
            }
        }
        if self.fits(needed)? {
            Ok(())
        } else {
            Err(RhizomeError::NoSpace { needed })
        }
    }

    fn fits(&self, needed: u64) -> Result<bool, RhizomeError> {
        Ok(self.used()? + needed + SPACE_RESERVE <= self.space)
    }

    /// Drop a stored file unless a referencing manifest outranks
    /// `max_priority`; in that case the blob stays and only manifests of
    /// lower priority lose their metadata.
    pub fn drop_stored_file(
        &mut self,
        fileid: &str,
        max_priority: i64,
    ) -> Result<(), RhizomeError> {
        let manifests: Vec<String> = {
            let mut stmt =
                self.conn.prepare("SELECT manifestid FROM FILEMANIFESTS WHERE fileid = ?1")?;
            let rows = stmt.query_map(params![fileid], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut retain_file = false;
        let mut priorities = Vec::with_capacity(manifests.len());
        for manifest_id in &manifests {
            let priority = self.manifest_priority(manifest_id)?;
            if priority > max_priority {
                retain_file = true;
            }
            priorities.push(priority);
        }

        let tx = self.conn.transaction()?;
        for (manifest_id, priority) in manifests.iter().zip(&priorities) {
            if retain_file && *priority >= max_priority {
                continue;
            }
            tx.execute("DELETE FROM MANIFESTS WHERE id = ?1", params![manifest_id])?;
            tx.execute("DELETE FROM MANIFESTGROUPS WHERE manifestid = ?1", params![manifest_id])?;
            tx.execute(
                "DELETE FROM FILEMANIFESTS WHERE manifestid = ?1 AND fileid = ?2",
                params![manifest_id, fileid],
            )?;
        }
        if retain_file {
            // keep the blob; its priority drops to the surviving maximum
            let remaining: Option<i64> = tx
                .query_row(
                    "SELECT MAX(g.priority)
                     FROM FILEMANIFESTS fm
                     JOIN MANIFESTGROUPS mg ON mg.manifestid = fm.manifestid
                     JOIN GROUPS g ON g.id = mg.groupid
                     WHERE fm.fileid = ?1",
                    params![fileid],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            if let Some(priority) = remaining {
                tx.execute(
                    "UPDATE FILES SET highestpriority = ?2 WHERE id = ?1",
                    params![fileid, priority],
                )?;
            }
        } else {
            tx.execute("DELETE FROM FILES WHERE id = ?1", params![fileid])?;
            log::debug!("rz: evicted file {fileid}");
        }
        tx.commit()?;
        Ok(())
    }

    /// Effective priority of a manifest: the highest priority of any group
    /// it belongs to, zero when it belongs to none.
    pub fn manifest_priority(&self, manifest_id: &str) -> Result<i64, RhizomeError> {
        let priority: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(g.priority)
                 FROM MANIFESTGROUPS mg
                 JOIN GROUPS g ON g.id = mg.groupid
                 WHERE mg.manifestid = ?1",
                params![manifest_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(priority.unwrap_or(0))
    }

    pub fn manifest_version(&self, id: &str) -> Result<Option<u64>, RhizomeError> {
        let version: Option<i64> = self
            .conn
            .query_row("SELECT version FROM MANIFESTS WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(version.map(|v| v.max(0) as u64))
    }

    pub fn manifest_bytes(&self, id: &str) -> Result<Option<Vec<u8>>, RhizomeError> {
        Ok(self
            .conn
            .query_row("SELECT manifest FROM MANIFESTS WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?)
    }

    /// Look a manifest up by a hex BAR prefix of its id.
    pub fn manifest_by_bar_prefix(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>, RhizomeError> {
        let pattern = format!("{}%", hex::encode_upper(prefix));
        Ok(self
            .conn
            .query_row(
                "SELECT manifest FROM MANIFESTS WHERE id LIKE ?1 LIMIT 1",
                params![pattern],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn payload(&self, fileid: &str) -> Result<Option<Vec<u8>>, RhizomeError> {
        Ok(self
            .conn
            .query_row(
                "SELECT data FROM FILES WHERE id = ?1",
                params![fileid.to_ascii_uppercase()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn payload_length(&self, fileid: &str) -> Result<Option<u64>, RhizomeError> {
        let length: Option<i64> = self
            .conn
            .query_row(
                "SELECT length FROM FILES WHERE id = ?1",
                params![fileid.to_ascii_uppercase()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(length.map(|len| len.max(0) as u64))
    }

    /// Sum of stored payload lengths (space accounting sanity checks).
    pub fn total_payload_bytes(&self) -> Result<u64, RhizomeError> {
        let total: Option<i64> =
            self.conn.query_row("SELECT SUM(length) FROM FILES", [], |row| row.get(0))?;
        Ok(total.unwrap_or(0).max(0) as u64)
    }

    /// `(id, version, filehash)` for every stored bundle.
    pub fn list_bundles(&self) -> Result<Vec<(String, u64, Option<String>)>, RhizomeError> {
        let mut stmt =
            self.conn.prepare("SELECT id, version FROM MANIFESTS ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut bundles = Vec::new();
        for row in rows {
            let (id, version) = row?;
            let filehash: Option<String> = self
                .conn
                .query_row(
                    "SELECT fileid FROM FILEMANIFESTS WHERE manifestid = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            bundles.push((id, version.max(0) as u64, filehash));
        }
        Ok(bundles)
    }

    /// BARs for every bundle inside the cursor window, ordered by
    /// `(payload_size, bundle_id)`, at most `max` of them. The cursor's
    /// limit fields are set to the high edge actually reached.
    pub fn bars_in_range(
        &self,
        cursor: &mut SyncCursor,
        max: usize,
    ) -> Result<Vec<Bar>, RhizomeError> {
        let mut stmt = self.conn.prepare(
            "SELECT m.id, m.manifest, IFNULL(f.length, 0) AS len
             FROM MANIFESTS m
             LEFT JOIN FILEMANIFESTS fm ON fm.manifestid = m.id
             LEFT JOIN FILES f ON f.id = fm.fileid
             ORDER BY len ASC, m.id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut bars = Vec::new();
        for row in rows {
            if bars.len() >= max {
                break;
            }
            let (id, manifest_bytes, len) = row?;
            let len = len.max(0) as u64;
            let bid = match hex::decode(&id) {
                Ok(bid) => bid,
                Err(_) => continue,
            };
            if !cursor.contains(len, &bid) {
                continue;
            }
            let manifest = match Manifest::parse(&manifest_bytes) {
                Ok(manifest) => manifest,
                Err(err) => {
                    log::warn!("rz: stored manifest {id} failed to parse: {err}");
                    continue;
                }
            };
            match Bar::from_manifest(&manifest, 64) {
                Ok(bar) => {
                    cursor.limit_size_high = len;
                    let mut high = [0u8; 32];
                    high[..bid.len().min(32)].copy_from_slice(&bid[..bid.len().min(32)]);
                    cursor.limit_bid_high = high;
                    bars.push(bar);
                }
                Err(err) => log::warn!("rz: cannot build BAR for {id}: {err}"),
            }
        }
        Ok(bars)
    }

    /// The freshest BARs, for piggybacking on outgoing overlay packets.
    pub fn advertisable_bars(&self, max: usize) -> Result<Vec<Bar>, RhizomeError> {
        let mut stmt = self
            .conn
            .prepare("SELECT manifest FROM MANIFESTS ORDER BY rowid DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![max as i64], |row| row.get::<_, Vec<u8>>(0))?;
        let mut bars = Vec::new();
        for row in rows {
            if let Ok(manifest) = Manifest::parse(&row?) {
                if let Ok(bar) = Bar::from_manifest(&manifest, 64) {
                    bars.push(bar);
                }
            }
        }
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::SERVICE_FILE;
    use mycel_identity as identity;
    use rand_core::OsRng;

    fn bundle(payload: &[u8], version: u64) -> Manifest {
        let mut manifest = Manifest::new();
        manifest.set("service", SERVICE_FILE);
        manifest.set("name", "blob.bin");
        manifest.set_u64("date", 1_700_000_000_000);
        manifest.set_u64("version", version);
        manifest.set_u64("filesize", payload.len() as u64);
        if !payload.is_empty() {
            manifest.set("filehash", identity::sha512_hex(payload));
        }
        manifest.create_id(OsRng, None);
        manifest.sign().expect("sign");
        manifest
    }

    fn reversioned(manifest: &Manifest, payload: &[u8], version: u64) -> Manifest {
        let mut next = Manifest::new();
        for key in ["service", "name", "date", "id"] {
            if let Some(value) = manifest.get(key) {
                next.set(key, value);
            }
        }
        next.set_u64("version", version);
        next.set_u64("filesize", payload.len() as u64);
        if !payload.is_empty() {
            next.set("filehash", identity::sha512_hex(payload));
        }
        next.set_secret(*manifest.secret().expect("secret")).expect("same id");
        next.sign().expect("sign");
        next
    }

    #[test]
    fn add_and_fetch_roundtrip() {
        let mut store = RhizomeStore::in_memory(10 << 20).expect("store");
        let manifest = bundle(b"payload bytes", 1);
        let outcome = store.add_bundle(&manifest, Some(b"payload bytes"), PRIORITY_DEFAULT)
            .expect("add");
        assert_eq!(outcome, AddOutcome::New);

        let id = manifest.id().expect("id").to_hex();
        assert_eq!(store.manifest_version(&id).expect("query"), Some(1));
        let hash = manifest.filehash().expect("hash");
        assert_eq!(store.payload(hash).expect("query").expect("blob"), b"payload bytes");
    }

    #[test]
    fn duplicate_and_version_rules() {
        let mut store = RhizomeStore::in_memory(10 << 20).expect("store");
        let v1 = bundle(b"one", 10);
        store.add_bundle(&v1, Some(b"one"), PRIORITY_DEFAULT).expect("add v1");

        // same id, same version
        let again = reversioned(&v1, b"one", 10);
        assert!(matches!(
            store.add_bundle(&again, Some(b"one"), PRIORITY_DEFAULT),
            Err(RhizomeError::AlreadyPresent)
        ));

        // same id, older version
        let older = reversioned(&v1, b"zero", 5);
        assert!(matches!(
            store.add_bundle(&older, Some(b"zero"), PRIORITY_DEFAULT),
            Err(RhizomeError::Stale)
        ));

        // same id, newer version replaces atomically
        let newer = reversioned(&v1, b"two!", 20);
        assert_eq!(
            store.add_bundle(&newer, Some(b"two!"), PRIORITY_DEFAULT).expect("add v2"),
            AddOutcome::Replaced
        );
        let id = v1.id().expect("id").to_hex();
        assert_eq!(store.manifest_version(&id).expect("query"), Some(20));
        // the replaced payload blob is gone with its last reference
        assert!(store.payload(v1.filehash().expect("hash")).expect("query").is_none());
        assert!(store.payload(newer.filehash().expect("hash")).expect("query").is_some());
    }

    #[test]
    fn unsigned_bundles_are_refused() {
        let mut store = RhizomeStore::in_memory(10 << 20).expect("store");
        let mut manifest = Manifest::new();
        manifest.set("service", SERVICE_FILE);
        manifest.set("name", "x");
        manifest.set_u64("date", 1);
        manifest.set_u64("version", 1);
        manifest.set_u64("filesize", 0);
        manifest.create_id(OsRng, None);
        assert!(matches!(
            store.add_bundle(&manifest, None, PRIORITY_DEFAULT),
            Err(RhizomeError::Crypto(_))
        ));
    }

    #[test]
    fn priority_eviction_frees_lower_priority_files() {
        let mut store = RhizomeStore::in_memory(1 << 20).expect("store");
        let big = vec![0xA5u8; 900 << 10];
        let low = bundle(&big, 1);
        store.add_bundle(&low, Some(&big), PRIORITY_BULK).expect("add low");

        let medium = vec![0x5Au8; 300 << 10];
        let high = bundle(&medium, 1);
        store.add_bundle(&high, Some(&medium), PRIORITY_OPTIONAL).expect("evicts the big one");

        assert!(store.payload(low.filehash().expect("hash")).expect("q").is_none());
        assert!(store.payload(high.filehash().expect("hash")).expect("q").is_some());
        assert!(store.total_payload_bytes().expect("sum") <= (1 << 20) - (64 << 10));
    }

    #[test]
    fn make_space_never_evicts_equal_or_higher_priority() {
        let mut store = RhizomeStore::in_memory(1 << 20).expect("store");
        let big = vec![1u8; 900 << 10];
        let stored = bundle(&big, 1);
        store.add_bundle(&stored, Some(&big), PRIORITY_OPTIONAL).expect("add");

        let incoming = vec![2u8; 300 << 10];
        let same_priority = bundle(&incoming, 1);
        assert!(matches!(
            store.add_bundle(&same_priority, Some(&incoming), PRIORITY_OPTIONAL),
            Err(RhizomeError::NoSpace { .. })
        ));
        assert!(store.payload(stored.filehash().expect("hash")).expect("q").is_some());
    }

    #[test]
    fn bars_enumerate_in_size_then_id_order() {
        let mut store = RhizomeStore::in_memory(10 << 20).expect("store");
        for (size, version) in [(3usize, 1u64), (1, 1), (2, 1)] {
            let payload = vec![7u8; size * 1000];
            let manifest = bundle(&payload, version);
            store.add_bundle(&manifest, Some(&payload), PRIORITY_DEFAULT).expect("add");
        }
        let mut cursor = SyncCursor::full_range();
        let bars = store.bars_in_range(&mut cursor, 100).expect("bars");
        assert_eq!(bars.len(), 3);
        let sizes: Vec<u8> = bars.iter().map(|bar| bar.log_size).collect();
        let mut sorted = sizes.clone();
        sorted.sort_unstable();
        assert_eq!(sizes, sorted);
        assert_eq!(cursor.limit_size_high, 3000);
    }

    #[test]
    fn bar_prefix_lookup() {
        let mut store = RhizomeStore::in_memory(10 << 20).expect("store");
        let manifest = bundle(b"data", 1);
        store.add_bundle(&manifest, Some(b"data"), PRIORITY_DEFAULT).expect("add");

        let bar = Bar::from_manifest(&manifest, 64).expect("bar");
        let found = store
            .manifest_by_bar_prefix(&bar.bid_prefix)
            .expect("query")
            .expect("stored manifest");
        assert_eq!(found, manifest.to_bytes());
        assert!(store.manifest_by_bar_prefix(&[0u8; 15]).expect("query").is_none());
    }
}
