//! Global logical clock shared by every syncable table

use rusqlite::Connection;

use crate::error::Result;
use crate::models::VersionStamp;

/// Issues version stamps from the single-row `version_counter` table.
///
/// `next` is one atomic `UPDATE ... RETURNING` statement, so concurrent
/// writers serialize on the row and never observe the same value. When it
/// runs inside a write transaction the stamp commits or rolls back with the
/// row it was issued for.
pub struct VersionAuthority<'a> {
    conn: &'a Connection,
}

impl<'a> VersionAuthority<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Issue a stamp strictly greater than every stamp issued before
    pub fn next(&self) -> Result<VersionStamp> {
        let value: i64 = self.conn.query_row(
            "UPDATE version_counter SET value = value + 1 WHERE id = 1 RETURNING value",
            [],
            |row| row.get(0),
        )?;
        Ok(VersionStamp::new(value))
    }

    /// Highest stamp issued so far (zero on an empty store)
    pub fn current(&self) -> Result<VersionStamp> {
        let value: i64 =
            self.conn
                .query_row("SELECT value FROM version_counter WHERE id = 1", [], |row| {
                    row.get(0)
                })?;
        Ok(VersionStamp::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn starts_at_zero() {
        let db = Database::open_in_memory().unwrap();
        let authority = VersionAuthority::new(db.connection());
        assert_eq!(authority.current().unwrap(), VersionStamp::ZERO);
    }

    #[test]
    fn next_is_strictly_increasing() {
        let db = Database::open_in_memory().unwrap();
        let authority = VersionAuthority::new(db.connection());

        let mut previous = authority.current().unwrap();
        for _ in 0..50 {
            let stamp = authority.next().unwrap();
            assert!(stamp > previous);
            previous = stamp;
        }
        assert_eq!(authority.current().unwrap(), previous);
    }

    #[test]
    fn rolled_back_stamp_is_not_observed() {
        let mut db = Database::open_in_memory().unwrap();
        let before = VersionAuthority::new(db.connection()).current().unwrap();

        {
            let tx = db.connection_mut().transaction().unwrap();
            VersionAuthority::new(&tx).next().unwrap();
            tx.rollback().unwrap();
        }

        let authority = VersionAuthority::new(db.connection());
        assert_eq!(authority.current().unwrap(), before);
        assert!(authority.next().unwrap() > before);
    }
}
