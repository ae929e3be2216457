use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

use crate::channel::reference::{InitialLoadInfo, MessageReference, ReferenceInfo};
use crate::error::{ChannelError, ChannelResult};
use crate::persistence::PersistenceManager;
use crate::store::Message;

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS messages (
            id BLOB PRIMARY KEY,
            priority INTEGER NOT NULL,
            reliable INTEGER NOT NULL,
            payload BLOB NOT NULL
        )",
        [],
    )?;

    // Reference rows. page_ord NULL means the row is unpaged; rowid keeps
    // insertion order for the initial-load prefix.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS refs (
            channel_id INTEGER NOT NULL,
            message_id BLOB NOT NULL,
            delivery_count INTEGER NOT NULL,
            reliable INTEGER NOT NULL,
            page_ord INTEGER,
            PRIMARY KEY (channel_id, message_id)
        )",
        [],
    )?;

    // Crucial index for range reads of the paged segment.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_refs_page
         ON refs (channel_id, page_ord)",
        [],
    )?;

    Ok(())
}

fn upsert_message(tx: &Transaction, message: &Message) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO messages (id, priority, reliable, payload)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    stmt.execute(params![
        message.id,
        message.priority,
        message.reliable,
        message.payload.as_ref(),
    ])?;
    Ok(())
}

fn upsert_ref(
    tx: &Transaction,
    channel_id: u64,
    reference: &MessageReference,
    page_ord: Option<i64>,
) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR REPLACE INTO refs (channel_id, message_id, delivery_count, reliable, page_ord)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    stmt.execute(params![
        channel_id as i64,
        reference.message_id(),
        reference.delivery_count(),
        reference.is_reliable(),
        page_ord,
    ])?;
    Ok(())
}

fn delete_ref(tx: &Transaction, channel_id: u64, message_id: Uuid) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare_cached("DELETE FROM refs WHERE channel_id = ?1 AND message_id = ?2")?;
    stmt.execute(params![channel_id as i64, message_id])?;

    // Bodies with no remaining reference row go with them.
    let mut orphan = tx.prepare_cached(
        "DELETE FROM messages
         WHERE id = ?1 AND NOT EXISTS (SELECT 1 FROM refs WHERE message_id = ?1)",
    )?;
    orphan.execute(params![message_id])?;
    Ok(())
}

pub struct SqlitePersistenceManager {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqlitePersistenceManager {
    pub fn open(db_path: impl AsRef<Path>) -> ChannelResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ChannelError::store("open", format!("{:?}: {}", parent, e)))?;
        }
        let conn = Connection::open(&db_path)
            .map_err(|e| ChannelError::store("open", format!("{:?}: {}", db_path, e)))?;
        init_db(&conn).map_err(|e| ChannelError::store("init_db", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl PersistenceManager for SqlitePersistenceManager {
    fn channel_id_for(&self, name: &str) -> ChannelResult<u64> {
        let conn = self.conn.lock();
        conn.execute("INSERT OR IGNORE INTO channels (name) VALUES (?1)", params![name])
            .map_err(|e| ChannelError::store("channel_id_for", e))?;
        conn.query_row(
            "SELECT id FROM channels WHERE name = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .map(|id| id as u64)
        .map_err(|e| ChannelError::store("channel_id_for", e))
    }

    fn add_reference(&self, channel_id: u64, reference: &MessageReference) -> ChannelResult<()> {
        let op = "add_reference";
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| ChannelError::store(op, e))?;
        upsert_message(&tx, reference.message()).map_err(|e| ChannelError::store(op, e))?;
        upsert_ref(&tx, channel_id, reference, None).map_err(|e| ChannelError::store(op, e))?;
        tx.commit().map_err(|e| ChannelError::store(op, e))
    }

    fn remove_reference(&self, channel_id: u64, message_id: Uuid) -> ChannelResult<()> {
        let op = "remove_reference";
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| ChannelError::store(op, e))?;
        delete_ref(&tx, channel_id, message_id).map_err(|e| ChannelError::store(op, e))?;
        tx.commit().map_err(|e| ChannelError::store(op, e))
    }

    fn get_initial_reference_infos(
        &self,
        channel_id: u64,
        limit: usize,
    ) -> ChannelResult<InitialLoadInfo> {
        let op = "get_initial_reference_infos";
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| ChannelError::store(op, e))?;

        let mut unpaged: Vec<ReferenceInfo> = {
            let mut stmt = tx
                .prepare_cached(
                    "SELECT message_id, delivery_count, reliable FROM refs
                     WHERE channel_id = ?1 AND page_ord IS NULL
                     ORDER BY rowid ASC",
                )
                .map_err(|e| ChannelError::store(op, e))?;
            stmt.query_map(params![channel_id as i64], |row| {
                Ok(ReferenceInfo {
                    message_id: row.get(0)?,
                    delivery_count: row.get(1)?,
                    reliable: row.get(2)?,
                    paging_order: None,
                })
            })
            .and_then(|rows| rows.collect())
            .map_err(|e| ChannelError::store(op, e))?
        };

        // Unpaged rows beyond the memory budget are re-paged past the
        // current maximum so load() never overfills memory.
        if unpaged.len() > limit {
            let overflow = unpaged.split_off(limit);
            let mut order: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(page_ord) + 1, 0) FROM refs
                     WHERE channel_id = ?1 AND page_ord IS NOT NULL",
                    params![channel_id as i64],
                    |row| row.get(0),
                )
                .map_err(|e| ChannelError::store(op, e))?;
            for info in &overflow {
                tx.execute(
                    "UPDATE refs SET page_ord = ?1 WHERE channel_id = ?2 AND message_id = ?3",
                    params![order, channel_id as i64, info.message_id],
                )
                .map_err(|e| ChannelError::store(op, e))?;
                order += 1;
            }
        }

        let page_window = tx
            .query_row(
                "SELECT MIN(page_ord), MAX(page_ord) FROM refs
                 WHERE channel_id = ?1 AND page_ord IS NOT NULL",
                params![channel_id as i64],
                |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .map_err(|e| ChannelError::store(op, e))?;
        let page_window = match page_window {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        };

        tx.commit().map_err(|e| ChannelError::store(op, e))?;
        Ok(InitialLoadInfo {
            refs: unpaged,
            page_window,
        })
    }

    fn get_paged_reference_infos(
        &self,
        channel_id: u64,
        from_order: i64,
        count: usize,
    ) -> ChannelResult<Vec<ReferenceInfo>> {
        let op = "get_paged_reference_infos";
        let to_order = from_order + count as i64 - 1;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT message_id, delivery_count, reliable, page_ord FROM refs
                 WHERE channel_id = ?1 AND page_ord BETWEEN ?2 AND ?3
                 ORDER BY page_ord ASC",
            )
            .map_err(|e| ChannelError::store(op, e))?;
        stmt.query_map(params![channel_id as i64, from_order, to_order], |row| {
            Ok(ReferenceInfo {
                message_id: row.get(0)?,
                delivery_count: row.get(1)?,
                reliable: row.get(2)?,
                paging_order: row.get(3)?,
            })
        })
        .and_then(|rows| rows.collect())
        .map_err(|e| ChannelError::store(op, e))
    }

    fn get_messages(&self, ids: &[Uuid]) -> ChannelResult<Vec<Message>> {
        let op = "get_messages";
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT id, priority, reliable, payload FROM messages WHERE id = ?1")
            .map_err(|e| ChannelError::store(op, e))?;
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let found = stmt
                .query_row(params![id], |row| {
                    Ok(Message {
                        id: row.get(0)?,
                        priority: row.get(1)?,
                        reliable: row.get(2)?,
                        payload: bytes::Bytes::from(row.get::<_, Vec<u8>>(3)?),
                    })
                })
                .optional()
                .map_err(|e| ChannelError::store(op, e))?;
            if let Some(message) = found {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn page_references(&self, channel_id: u64, refs: &[&MessageReference]) -> ChannelResult<()> {
        let op = "page_references";
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| ChannelError::store(op, e))?;
        for reference in refs {
            upsert_message(&tx, reference.message()).map_err(|e| ChannelError::store(op, e))?;
            upsert_ref(&tx, channel_id, reference, reference.paging_order())
                .map_err(|e| ChannelError::store(op, e))?;
        }
        tx.commit().map_err(|e| ChannelError::store(op, e))
    }

    fn update_page_order(&self, channel_id: u64, refs: &[&MessageReference]) -> ChannelResult<()> {
        let op = "update_page_order";
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| ChannelError::store(op, e))?;
        for reference in refs {
            let changed = {
                let mut stmt = tx
                    .prepare_cached(
                        "UPDATE refs SET page_ord = ?1, delivery_count = ?2
                         WHERE channel_id = ?3 AND message_id = ?4",
                    )
                    .map_err(|e| ChannelError::store(op, e))?;
                stmt.execute(params![
                    reference.paging_order(),
                    reference.delivery_count(),
                    channel_id as i64,
                    reference.message_id(),
                ])
                .map_err(|e| ChannelError::store(op, e))?
            };
            if changed != 1 {
                return Err(ChannelError::store(
                    op,
                    format!(
                        "no persisted row for message {} (touched {} rows)",
                        reference.message_id(),
                        changed
                    ),
                ));
            }
        }
        tx.commit().map_err(|e| ChannelError::store(op, e))
    }

    fn remove_depaged_references(&self, channel_id: u64, message_ids: &[Uuid]) -> ChannelResult<()> {
        let op = "remove_depaged_references";
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| ChannelError::store(op, e))?;
        for id in message_ids {
            delete_ref(&tx, channel_id, *id).map_err(|e| ChannelError::store(op, e))?;
        }
        tx.commit().map_err(|e| ChannelError::store(op, e))
    }

    fn update_reliable_refs_not_paged_in_range(
        &self,
        channel_id: u64,
        from_order: i64,
        to_order: i64,
        expected_count: usize,
    ) -> ChannelResult<()> {
        let op = "update_reliable_refs_not_paged_in_range";
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| ChannelError::store(op, e))?;
        let changed = tx
            .execute(
                "UPDATE refs SET page_ord = NULL
                 WHERE channel_id = ?1 AND reliable = 1 AND page_ord BETWEEN ?2 AND ?3",
                params![channel_id as i64, from_order, to_order],
            )
            .map_err(|e| ChannelError::store(op, e))?;
        if changed != expected_count {
            // Dropping the transaction rolls the update back.
            return Err(ChannelError::store(
                op,
                format!(
                    "expected {} reliable rows in [{}, {}], touched {}",
                    expected_count, from_order, to_order, changed
                ),
            ));
        }
        tx.commit().map_err(|e| ChannelError::store(op, e))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;

    fn open_store() -> (SqlitePersistenceManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pm = SqlitePersistenceManager::open(dir.path().join("refs.db")).unwrap();
        (pm, dir)
    }

    fn make_ref(priority: u8, reliable: bool) -> MessageReference {
        let msg = Message::new(Bytes::from(format!("p{}", priority)), priority, reliable);
        MessageReference::new(Arc::new(msg), reliable)
    }

    #[test]
    fn test_channel_ids_are_stable() {
        let (pm, _dir) = open_store();
        let a = pm.channel_id_for("orders").unwrap();
        let b = pm.channel_id_for("invoices").unwrap();
        assert_ne!(a, b);
        assert_eq!(pm.channel_id_for("orders").unwrap(), a);
    }

    #[test]
    fn test_initial_load_repages_overflow() {
        let (pm, _dir) = open_store();
        let ch = pm.channel_id_for("bulk").unwrap();

        let refs: Vec<MessageReference> = (0..15).map(|_| make_ref(0, true)).collect();
        for r in &refs {
            pm.add_reference(ch, r).unwrap();
        }

        let info = pm.get_initial_reference_infos(ch, 10).unwrap();
        assert_eq!(info.refs.len(), 10);
        assert_eq!(info.page_window, Some((0, 4)));

        // The prefix keeps insertion order, the overflow keeps it too.
        let prefix_ids: Vec<Uuid> = info.refs.iter().map(|i| i.message_id).collect();
        let expected_prefix: Vec<Uuid> = refs[..10].iter().map(|r| r.message_id()).collect();
        assert_eq!(prefix_ids, expected_prefix);

        let paged = pm.get_paged_reference_infos(ch, 0, 5).unwrap();
        let paged_ids: Vec<Uuid> = paged.iter().map(|i| i.message_id).collect();
        let expected_paged: Vec<Uuid> = refs[10..].iter().map(|r| r.message_id()).collect();
        assert_eq!(paged_ids, expected_paged);
    }

    #[test]
    fn test_paged_range_read_with_negative_orders() {
        let (pm, _dir) = open_store();
        let ch = pm.channel_id_for("cancels").unwrap();

        let mut front = make_ref(0, false);
        front.paging_order = Some(-1);
        let mut back = make_ref(0, false);
        back.paging_order = Some(0);
        pm.page_references(ch, &[&front, &back]).unwrap();

        let rows = pm.get_paged_reference_infos(ch, -1, 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message_id, front.message_id());
        assert_eq!(rows[0].paging_order, Some(-1));
        assert_eq!(rows[1].message_id, back.message_id());
    }

    #[test]
    fn test_update_range_mismatch_rolls_back() {
        let (pm, _dir) = open_store();
        let ch = pm.channel_id_for("sanity").unwrap();

        let mut r = make_ref(0, true);
        pm.add_reference(ch, &r).unwrap();
        r.paging_order = Some(3);
        pm.update_page_order(ch, &[&r]).unwrap();

        let err = pm
            .update_reliable_refs_not_paged_in_range(ch, 0, 9, 2)
            .unwrap_err();
        assert!(matches!(err, ChannelError::Store { .. }));

        // The row kept its page order.
        let rows = pm.get_paged_reference_infos(ch, 0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].paging_order, Some(3));

        pm.update_reliable_refs_not_paged_in_range(ch, 0, 9, 1).unwrap();
        assert!(pm.get_paged_reference_infos(ch, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_get_messages_skips_missing_bodies() {
        let (pm, _dir) = open_store();
        let ch = pm.channel_id_for("bodies").unwrap();

        let r = make_ref(5, true);
        pm.add_reference(ch, &r).unwrap();

        let found = pm
            .get_messages(&[r.message_id(), Uuid::new_v4()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, r.message_id());
        assert_eq!(found[0].priority, 5);
    }

    #[test]
    fn test_remove_reference_drops_orphaned_body() {
        let (pm, _dir) = open_store();
        let ch = pm.channel_id_for("orphans").unwrap();

        let r = make_ref(0, true);
        pm.add_reference(ch, &r).unwrap();
        pm.remove_reference(ch, r.message_id()).unwrap();

        assert!(pm.get_messages(&[r.message_id()]).unwrap().is_empty());
    }
}
