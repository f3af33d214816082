//! Shared SQL-fragment builder for the claim/ack/abandon/fail/reap discipline that
//! `outbox`, `inbox`, `timers`, and `job_runs` all implement identically. Each
//! per-queue module supplies a `QueueTableSpec` describing its table and column
//! names; this module generates the five statements once instead of four parallel
//! hand-rolled copies of the same CTE.

/// Status values shared by every queue table. Inbox additionally distinguishes
/// `Dead` from `Failed` at the call site (same underlying column, different name).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Status {
    Ready = 0,
    InProgress = 1,
    Done = 2,
    Failed = 3,
}

impl Status {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(v: i16) -> Self {
        match v {
            0 => Status::Ready,
            1 => Status::InProgress,
            2 => Status::Done,
            _ => Status::Failed,
        }
    }
}

/// Describes the identity and due-time columns of a queue-backed table so the
/// generic claim/ack/abandon/fail/reap SQL can be generated for it.
pub struct QueueTableSpec {
    pub table: &'static str,
    pub id_column: &'static str,
    pub due_time_column: Option<&'static str>,
    pub order_by_fallback: &'static str,
}

impl QueueTableSpec {
    pub fn claim_sql(&self) -> String {
        let due_clause = match self.due_time_column {
            Some(col) => format!("and ({col} is null or {col} <= now())"),
            None => String::new(),
        };
        let order_by = match self.due_time_column {
            Some(col) => format!("{col} nulls first, {fallback}", fallback = self.order_by_fallback),
            None => self.order_by_fallback.to_string(),
        };
        format!(
            r#"
            with to_claim as (
                select {id}
                from {table}
                where status = {ready}
                  and (locked_until_utc is null or locked_until_utc <= now())
                  {due_clause}
                order by {order_by}
                limit $1
                for update skip locked
            )
            update {table}
               set status = {in_progress},
                   owner_token = $2,
                   locked_until_utc = now() + ($3 || ' seconds')::interval
             where {id} in (select {id} from to_claim)
            returning {id}
            "#,
            id = self.id_column,
            table = self.table,
            ready = Status::Ready.as_i16(),
            in_progress = Status::InProgress.as_i16(),
            due_clause = due_clause,
            order_by = order_by,
        )
    }

    /// Like [`Self::claim_sql`], but only for tables the scheduler loop claims from.
    /// Binds an extra `$4` fencing token and requires it be `>=` the database's
    /// current `scheduler_state.current_fencing_token` before any row is touched, so
    /// a scheduler instance that has already lost its lease to a newer one (whose
    /// `advance()` call raised that counter) claims nothing even if it races the
    /// newer instance to this statement.
    pub fn claim_sql_fenced(&self) -> String {
        let due_clause = match self.due_time_column {
            Some(col) => format!("and ({col} is null or {col} <= now())"),
            None => String::new(),
        };
        let order_by = match self.due_time_column {
            Some(col) => format!("{col} nulls first, {fallback}", fallback = self.order_by_fallback),
            None => self.order_by_fallback.to_string(),
        };
        format!(
            r#"
            with to_claim as (
                select {id}
                from {table}
                where status = {ready}
                  and (locked_until_utc is null or locked_until_utc <= now())
                  {due_clause}
                  and $4 >= (select current_fencing_token from scheduler_state where id = 1)
                order by {order_by}
                limit $1
                for update skip locked
            )
            update {table}
               set status = {in_progress},
                   owner_token = $2,
                   locked_until_utc = now() + ($3 || ' seconds')::interval
             where {id} in (select {id} from to_claim)
            returning {id}
            "#,
            id = self.id_column,
            table = self.table,
            ready = Status::Ready.as_i16(),
            in_progress = Status::InProgress.as_i16(),
            due_clause = due_clause,
            order_by = order_by,
        )
    }

    pub fn ack_sql(&self) -> String {
        format!(
            r#"
            update {table}
               set status = {done},
                   owner_token = null,
                   locked_until_utc = null
             where {id} = any($1)
               and owner_token = $2
               and status = {in_progress}
            returning {id}
            "#,
            table = self.table,
            id = self.id_column,
            done = Status::Done.as_i16(),
            in_progress = Status::InProgress.as_i16(),
        )
    }

    pub fn abandon_sql(&self) -> String {
        let due_set = match self.due_time_column {
            Some(col) => format!(", {col} = case when $4 > 0 then now() + ($4 || ' seconds')::interval else {col} end"),
            None => String::new(),
        };
        format!(
            r#"
            update {table}
               set status = {ready},
                   owner_token = null,
                   locked_until_utc = null,
                   retry_count = retry_count + 1,
                   last_error = coalesce($3, last_error)
                   {due_set}
             where {id} = any($1)
               and owner_token = $2
               and status = {in_progress}
            returning {id}
            "#,
            table = self.table,
            id = self.id_column,
            ready = Status::Ready.as_i16(),
            in_progress = Status::InProgress.as_i16(),
            due_set = due_set,
        )
    }

    pub fn fail_sql(&self) -> String {
        format!(
            r#"
            update {table}
               set status = {failed},
                   owner_token = null,
                   locked_until_utc = null,
                   last_error = coalesce($3, last_error)
             where {id} = any($1)
               and owner_token = $2
               and status = {in_progress}
            returning {id}
            "#,
            table = self.table,
            id = self.id_column,
            failed = Status::Failed.as_i16(),
            in_progress = Status::InProgress.as_i16(),
        )
    }

    pub fn reap_sql(&self) -> String {
        format!(
            r#"
            update {table}
               set status = {ready},
                   owner_token = null,
                   locked_until_utc = null
             where status = {in_progress}
               and locked_until_utc <= now()
            returning {id}
            "#,
            table = self.table,
            id = self.id_column,
            ready = Status::Ready.as_i16(),
            in_progress = Status::InProgress.as_i16(),
        )
    }
}
