//! Session-index builder (§4.7 "Session-index builder", §3 "Session-index
//! entry"): splits a session's messages into contiguous runs separated by
//! an inter-message gap threshold.

use crate::error::Result;
use crate::model::SessionIndexEntry;
use rusqlite::Connection;

/// Default inter-message gap threshold in seconds (§3).
pub const DEFAULT_GAP_THRESHOLD: i64 = 1800;

pub fn has_index(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM session_index", [], |r| r.get(0))?;
    Ok(count > 0)
}

pub fn current_threshold(conn: &Connection) -> Result<Option<i64>> {
    conn.query_row("SELECT gap_threshold FROM session_index_meta LIMIT 1", [], |r| {
        r.get(0)
    })
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other.into()),
    })
}

pub fn index_stats(conn: &Connection) -> Result<Vec<SessionIndexEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, start_ts, end_ts, message_count, first_message_id FROM session_index ORDER BY id",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok(SessionIndexEntry {
            id: r.get(0)?,
            start_ts: r.get(1)?,
            end_ts: r.get(2)?,
            message_count: r.get(3)?,
            first_message_id: r.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Drops the prior index atomically and clears the recorded threshold
/// (§4.7 "Re-builders invalidate the prior index atomically").
pub fn invalidate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
         DELETE FROM session_index;
         DELETE FROM session_index_meta;
         COMMIT;",
    )?;
    Ok(())
}

pub fn clear(conn: &Connection) -> Result<()> {
    invalidate(conn)
}

/// Scans messages in timestamp order, emitting a new run whenever the
/// inter-message gap exceeds `gap_threshold` (§4.7, §3).
pub fn rebuild(conn: &mut Connection, gap_threshold: i64) -> Result<usize> {
    let mut rows: Vec<(i64, i64)> = Vec::new();
    {
        let mut stmt = conn.prepare("SELECT id, ts FROM message ORDER BY ts ASC, id ASC")?;
        let mapped = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?;
        for row in mapped {
            rows.push(row?);
        }
    }

    let mut entries: Vec<(i64, i64, i64, i64)> = Vec::new(); // start, end, count, first_id
    let mut iter = rows.into_iter();
    if let Some((first_id, first_ts)) = iter.next() {
        let mut start = first_ts;
        let mut end = first_ts;
        let mut count = 1i64;
        let mut first_message_id = first_id;
        let mut last_ts = first_ts;

        for (id, ts) in iter {
            if ts - last_ts > gap_threshold {
                entries.push((start, end, count, first_message_id));
                start = ts;
                first_message_id = id;
                count = 0;
            }
            end = ts;
            count += 1;
            last_ts = ts;
        }
        entries.push((start, end, count, first_message_id));
    }

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM session_index", [])?;
    tx.execute("DELETE FROM session_index_meta", [])?;
    for (start_ts, end_ts, message_count, first_message_id) in &entries {
        tx.execute(
            "INSERT INTO session_index (start_ts, end_ts, message_count, first_message_id) VALUES (?1,?2,?3,?4)",
            rusqlite::params![start_ts, end_ts, message_count, first_message_id],
        )?;
    }
    tx.execute(
        "INSERT INTO session_index_meta (gap_threshold) VALUES (?1)",
        [gap_threshold],
    )?;
    tx.commit()?;
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::store::schema::create_base_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO member (platform_id, account_name) VALUES ('1','A')",
            [],
        )
        .unwrap();
        conn
    }

    fn insert_message(conn: &Connection, ts: i64) {
        conn.execute(
            "INSERT INTO message (sender_id, sender_account_name, ts, type, content) VALUES (1,'A',?1,0,'x')",
            [ts],
        )
        .unwrap();
    }

    #[test]
    fn splits_runs_on_large_gaps() {
        let mut conn = setup();
        for ts in [0, 10, 20, 5000, 5010] {
            insert_message(&conn, ts);
        }
        let count = rebuild(&mut conn, 1800).unwrap();
        assert_eq!(count, 2);
        let entries = index_stats(&conn).unwrap();
        assert_eq!(entries[0].message_count, 3);
        assert_eq!(entries[1].message_count, 2);
    }

    #[test]
    fn empty_session_produces_no_entries() {
        let mut conn = setup();
        let count = rebuild(&mut conn, 1800).unwrap();
        assert_eq!(count, 0);
        assert!(!has_index(&conn).unwrap());
    }
}
