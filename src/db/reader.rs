//! Engine-independent row cursor.
//!
//! A [`DataReader`] walks the result sets of one operation. Field access never fails
//! on NULL: typed getters take the value to return for NULL, a missing row or an
//! invalid index. Read failures are the other error channel: [`DataReader::read`] and
//! [`DataReader::next_result`] report them and return `false`, and the failure is
//! recorded against the repository when the reader is released.
//!
//! Releasing (explicitly or on drop) happens exactly once and completes the owning
//! operation: health counters, analytics and closing a connection opened for it.

use std::collections::HashMap;
use std::marker::PhantomData;

use tracing::warn;

use super::provider::{RawOutcome, ResultSet};
use super::session::{OpContext, Session};
use super::types::ColumnInfo;
use crate::error::{DalError, DalResult};
use crate::models::{Command, DbValue, FromDbValue};

/// The session a reader completes its operation on.
pub(crate) enum SessionRef<'s> {
    Borrowed(&'s mut Session),
    Owned(Box<Session>),
}

impl SessionRef<'_> {
    fn get(&self) -> &Session {
        match self {
            Self::Borrowed(s) => s,
            Self::Owned(s) => s,
        }
    }

    fn get_mut(&mut self) -> &mut Session {
        match self {
            Self::Borrowed(s) => s,
            Self::Owned(s) => s,
        }
    }
}

pub struct DataReader<'s> {
    session: SessionRef<'s>,
    sets: Vec<ResultSet>,
    set_index: usize,
    /// `None` before the first `read` of the current set
    row_index: Option<usize>,
    records_affected: u64,
    shape_name: String,
    ctx: OpContext,
    failure: Option<DalError>,
    released: bool,
}

impl std::fmt::Debug for DataReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReader")
            .field("shape_name", &self.shape_name)
            .field("sets", &self.sets.len())
            .field("set_index", &self.set_index)
            .field("row_index", &self.row_index)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<'s> DataReader<'s> {
    pub(crate) fn new(
        session: SessionRef<'s>,
        outcome: RawOutcome,
        ctx: OpContext,
        shape_name: String,
    ) -> Self {
        Self {
            session,
            sets: outcome.sets,
            set_index: 0,
            row_index: None,
            records_affected: outcome.rows_affected,
            shape_name,
            ctx,
            failure: None,
            released: false,
        }
    }

    /// `repository:engine:command_type:text` of the operation that produced the rows.
    pub fn shape_name(&self) -> &str {
        &self.shape_name
    }

    pub fn records_affected(&self) -> u64 {
        self.records_affected
    }

    /// The operation's command, with output values already stored.
    pub fn command(&self) -> Option<&Command> {
        self.session.get().command()
    }

    /// True once a read failure was observed.
    pub fn has_errors(&self) -> bool {
        self.failure.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn current_set(&self) -> Option<&ResultSet> {
        self.sets.get(self.set_index)
    }

    fn current_row(&self) -> Option<&[DbValue]> {
        let set = self.current_set()?;
        set.rows.get(self.row_index?).map(Vec::as_slice)
    }

    /// Advance to the next row of the current set.
    pub fn read(&mut self) -> bool {
        if self.released {
            return false;
        }
        let Some(set) = self.sets.get_mut(self.set_index) else {
            return false;
        };
        let next = self.row_index.map_or(0, |i| i + 1);
        if next < set.rows.len() {
            self.row_index = Some(next);
            return true;
        }
        self.row_index = Some(set.rows.len());
        if let Some(err) = set.error.take() {
            self.fail(err, "Failed to read next row");
        }
        false
    }

    /// Move to the next result set.
    pub fn next_result(&mut self) -> bool {
        if self.released {
            return false;
        }
        // An unread failure at the end of this set ends the stream
        if let Some(err) = self.sets.get_mut(self.set_index).and_then(|s| s.error.take()) {
            self.fail(err, "Failed to advance to next result");
            self.set_index = self.sets.len();
            return false;
        }
        if self.set_index >= self.sets.len() {
            return false;
        }
        self.set_index += 1;
        self.row_index = None;
        self.set_index < self.sets.len()
    }

    fn fail(&mut self, err: DalError, message: &str) {
        self.session.get().report(&err, message);
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        self.current_set().map(|s| s.columns.as_slice()).unwrap_or(&[])
    }

    pub fn field_count(&self) -> usize {
        self.columns().len()
    }

    pub fn get_field_name(&self, index: usize) -> Option<&str> {
        self.columns().get(index).map(|c| c.name.as_str())
    }

    /// Case-insensitive column lookup.
    pub fn get_field_index(&self, name: &str) -> Option<usize> {
        self.columns()
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Raw value of a field in the current row.
    pub fn value(&self, index: usize) -> Option<&DbValue> {
        self.current_row()?.get(index)
    }

    pub fn values(&self) -> Option<&[DbValue]> {
        self.current_row()
    }

    /// True for NULL, and for positions without a value (no current row or an
    /// invalid index).
    pub fn is_null(&self, index: usize) -> bool {
        self.value(index).is_none_or(DbValue::is_null)
    }

    /// Typed value of a field, or `default` when it is NULL, absent or not
    /// convertible.
    pub fn get<T: FromDbValue>(&self, index: usize, default: T) -> T {
        match self.value(index) {
            None | Some(DbValue::Null) => default,
            Some(value) => match T::from_non_null(value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(column = index, error = %e, "Field conversion failed, using default");
                    default
                }
            },
        }
    }

    pub fn get_by_name<T: FromDbValue>(&self, name: &str, default: T) -> T {
        match self.get_field_index(name) {
            Some(index) => self.get(index, default),
            None => default,
        }
    }

    /// Strict typed access: NULL converts through [`FromDbValue::from_null`], an
    /// invalid position or conversion failure is an error.
    pub fn try_get<T: FromDbValue>(&self, index: usize) -> DalResult<T> {
        let repository = self.session.get().repository().name();
        let value = self.value(index).ok_or_else(|| {
            DalError::result_conversion(repository, format!("no value at field {}", index))
        })?;
        T::from_db_value(value).map_err(|e| {
            DalError::result_conversion(repository, format!("field {}: {}", index, e))
        })
    }

    pub fn try_get_by_name<T: FromDbValue>(&self, name: &str) -> DalResult<T> {
        let index = self.get_field_index(name).ok_or_else(|| {
            DalError::result_conversion(
                self.session.get().repository().name(),
                format!("no field named '{}'", name),
            )
        })?;
        self.try_get(index)
    }

    /// Enumerations are stored as their integer representation.
    pub fn get_enum<E: TryFrom<i64>>(&self, index: usize, default: E) -> E {
        match self.value(index) {
            None | Some(DbValue::Null) => default,
            Some(value) => i64::from_non_null(value)
                .ok()
                .and_then(|n| E::try_from(n).ok())
                .unwrap_or(default),
        }
    }

    /// Complete the operation. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let result = match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        let ctx = self.ctx.clone();
        let _ = self.session.get_mut().settle(&ctx, result, true);
    }

    /// Map rows of the current set to `T` lazily.
    pub fn into_enumerable<T: FromDataRow>(self) -> DataEnumerator<'s, T> {
        DataEnumerator {
            reader: self,
            done: false,
            _marker: PhantomData,
        }
    }
}

impl Drop for DataReader<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Maps the current row of a reader to a value. This is the contract for object
/// mappers.
pub trait FromDataRow: Sized {
    fn from_row(row: &DataReader<'_>) -> DalResult<Self>;
}

impl FromDataRow for Vec<DbValue> {
    fn from_row(row: &DataReader<'_>) -> DalResult<Self> {
        Ok(row.values().map(<[DbValue]>::to_vec).unwrap_or_default())
    }
}

impl FromDataRow for HashMap<String, DbValue> {
    fn from_row(row: &DataReader<'_>) -> DalResult<Self> {
        Ok(row
            .columns()
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), row.value(i).cloned().unwrap_or_default()))
            .collect())
    }
}

/// Rows of a reader's current set as `T`, releasing the reader when the rows run
/// out, on the first mapping error, or on drop.
pub struct DataEnumerator<'s, T> {
    reader: DataReader<'s>,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DataEnumerator<'_, T> {
    pub fn shape_name(&self) -> &str {
        self.reader.shape_name()
    }
}

impl<T: FromDataRow> Iterator for DataEnumerator<'_, T> {
    type Item = DalResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.reader.read() {
            self.done = true;
            self.reader.release();
            return None;
        }
        match T::from_row(&self.reader) {
            Ok(item) => Some(Ok(item)),
            Err(e) => {
                self.done = true;
                let repository = self.reader.session.get().repository().name().to_string();
                if self.reader.failure.is_none() {
                    self.reader.failure =
                        Some(DalError::result_conversion(repository, e.to_string()));
                }
                self.reader.release();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use crate::cluster::Repository;
    use crate::config::RepositoryConfig;
    use crate::db::observe::Observers;
    use crate::db::provider::ProviderRegistry;

    fn session() -> Session {
        let config = RepositoryConfig::new("mem", "sqlite::memory:");
        let repo = Repository::from_config(&config, &ProviderRegistry::with_builtin()).unwrap();
        Session::new(Arc::new(repo), Observers::default())
    }

    fn outcome(error: Option<DalError>) -> RawOutcome {
        RawOutcome {
            sets: vec![
                ResultSet {
                    columns: vec![
                        ColumnInfo {
                            name: "Id".to_string(),
                            type_name: "INTEGER".to_string(),
                        },
                        ColumnInfo {
                            name: "name".to_string(),
                            type_name: "TEXT".to_string(),
                        },
                    ],
                    rows: vec![
                        vec![DbValue::Int(1), DbValue::Text("a".into())],
                        vec![DbValue::Int(2), DbValue::Null],
                    ],
                    error,
                },
                ResultSet {
                    columns: vec![ColumnInfo {
                        name: "total".to_string(),
                        type_name: "INTEGER".to_string(),
                    }],
                    rows: vec![vec![DbValue::Int(2)]],
                    error: None,
                },
            ],
            ..Default::default()
        }
    }

    fn ctx() -> OpContext {
        OpContext {
            opened_here: false,
            in_transaction: false,
            started: Instant::now(),
            command_text: "SELECT".to_string(),
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Kind {
        One,
        Two,
    }

    impl TryFrom<i64> for Kind {
        type Error = ();
        fn try_from(v: i64) -> Result<Self, ()> {
            match v {
                1 => Ok(Kind::One),
                2 => Ok(Kind::Two),
                _ => Err(()),
            }
        }
    }

    #[test]
    fn test_field_access() {
        let mut s = session();
        let mut reader = DataReader::new(
            SessionRef::Borrowed(&mut s),
            outcome(None),
            ctx(),
            "mem:sqlite:Text:SELECT".into(),
        );
        assert_eq!(reader.field_count(), 2);
        assert_eq!(reader.get_field_index("ID"), Some(0));
        assert_eq!(reader.get_field_name(1), Some("name"));
        assert!(reader.is_null(0), "no current row yet");

        assert!(reader.read());
        assert_eq!(reader.get::<i32>(0, -1), 1);
        assert_eq!(reader.get_by_name::<String>("NAME", String::new()), "a");
        assert_eq!(reader.get_enum(0, Kind::Two), Kind::One);
        assert_eq!(reader.get::<i32>(9, -1), -1);

        assert!(reader.read());
        assert!(reader.is_null(1));
        assert_eq!(reader.get::<String>(1, "none".into()), "none");
        assert_eq!(reader.try_get::<Option<String>>(1).unwrap(), None);
        assert!(reader.try_get::<i32>(5).is_err());

        assert!(!reader.read());
        assert!(reader.next_result());
        assert!(reader.read());
        assert_eq!(reader.get_by_name::<i64>("total", 0), 2);
        assert!(!reader.next_result());
        assert!(!reader.has_errors());
    }

    #[test]
    fn test_read_failure_ends_iteration_and_counts_on_release() {
        let mut s = session();
        let repo = Arc::clone(s.repository());
        let mut reader = DataReader::new(
            SessionRef::Borrowed(&mut s),
            outcome(Some(DalError::execution("mem", "connection reset", None))),
            ctx(),
            String::new(),
        );
        assert!(reader.read());
        assert!(reader.read());
        assert!(!reader.read());
        assert!(reader.has_errors());
        assert_eq!(repo.total_failures(), 0);

        reader.release();
        reader.release();
        assert_eq!(repo.total_failures(), 1);
        assert_eq!(repo.total_successes(), 0);
    }

    #[test]
    fn test_drop_releases_once_with_success() {
        let mut s = session();
        let repo = Arc::clone(s.repository());
        {
            let _reader = DataReader::new(
                SessionRef::Borrowed(&mut s),
                outcome(None),
                ctx(),
                String::new(),
            );
        }
        assert_eq!(repo.total_successes(), 1);
    }

    #[test]
    fn test_enumerator_maps_first_set() {
        let mut s = session();
        let reader = DataReader::new(
            SessionRef::Borrowed(&mut s),
            outcome(None),
            ctx(),
            String::new(),
        );
        let rows: Vec<HashMap<String, DbValue>> = reader
            .into_enumerable()
            .collect::<DalResult<_>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["Id"], DbValue::Int(1));
        assert_eq!(rows[1]["name"], DbValue::Null);
    }
}
