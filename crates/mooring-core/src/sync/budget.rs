//! Execution-time budget for long-running read transactions

use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::error::{Error, Result};

/// Virtual machine instructions between deadline checks
const CHECK_EVERY_OPS: i32 = 1_000;

/// Arms a progress handler that interrupts any statement running past the
/// deadline. The handler is removed when the guard drops.
pub struct QueryBudget<'a> {
    conn: &'a Connection,
    budget: Duration,
    deadline: Instant,
}

impl<'a> QueryBudget<'a> {
    pub fn arm(conn: &'a Connection, budget: Duration) -> Self {
        let started = Instant::now();
        let deadline = started.checked_add(budget).unwrap_or(started);
        conn.progress_handler(CHECK_EVERY_OPS, Some(move || Instant::now() >= deadline));
        Self {
            conn,
            budget,
            deadline,
        }
    }

    /// Fail once the deadline has passed
    pub fn check(&self) -> Result<()> {
        if Instant::now() >= self.deadline {
            return Err(Error::Timeout(self.budget));
        }
        Ok(())
    }

    /// Translate an interrupted statement into `Error::Timeout`
    pub fn map_err(&self, error: Error) -> Error {
        match error {
            Error::Sqlite(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == rusqlite::ErrorCode::OperationInterrupted =>
            {
                Error::Timeout(self.budget)
            }
            other => other,
        }
    }
}

impl Drop for QueryBudget<'_> {
    fn drop(&mut self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    const HEAVY_QUERY: &str = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 50000000)
         SELECT COUNT(*) FROM n";

    #[test]
    fn exhausted_budget_interrupts_statement() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let budget = QueryBudget::arm(conn, Duration::ZERO);

        let error = conn
            .query_row(HEAVY_QUERY, [], |row| row.get::<_, i64>(0))
            .map_err(|e| budget.map_err(e.into()))
            .unwrap_err();
        assert!(matches!(error, Error::Timeout(_)));
        assert!(budget.check().is_err());
    }

    #[test]
    fn handler_is_removed_on_drop() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        drop(QueryBudget::arm(conn, Duration::ZERO));

        let count: i64 = conn
            .query_row(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 10000)
                 SELECT COUNT(*) FROM n",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 10_000);
    }

    #[test]
    fn generous_budget_passes() {
        let db = Database::open_in_memory().unwrap();
        let budget = QueryBudget::arm(db.connection(), Duration::from_secs(60));
        assert!(budget.check().is_ok());
    }
}
