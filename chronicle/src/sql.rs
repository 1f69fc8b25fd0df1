//! SQL binding and decoding support for the engine's typed values.

use std::str::FromStr;

use sqlite as sql;
use sqlite::Value;

use crate::approval;
use crate::audit;
use crate::gate;
use crate::id::{ActorId, AnnotationId, ChangeId, DocumentId, ProposalId, SpaceId, ThreadId};
use crate::proposal;
use crate::thread;

/// Run a database transaction.
pub fn transaction<T, E: From<sql::Error>>(
    db: &sql::ConnectionThreadSafe,
    f: impl FnOnce(&sql::ConnectionThreadSafe) -> Result<T, E>,
) -> Result<T, E> {
    db.execute("BEGIN")?;
    match f(db) {
        Ok(result) => {
            db.execute("COMMIT")?;
            Ok(result)
        }
        Err(err) => {
            db.execute("ROLLBACK")?;
            Err(err)
        }
    }
}

/// Values stored as their string rendering.
macro_rules! impl_sql_str {
    ($type:ty) => {
        impl sql::BindableWithIndex for &$type {
            fn bind<I: sql::ParameterIndex>(
                self,
                stmt: &mut sql::Statement<'_>,
                i: I,
            ) -> sql::Result<()> {
                sql::BindableWithIndex::bind(self.to_string().as_str(), stmt, i)
            }
        }

        impl TryFrom<&Value> for $type {
            type Error = sql::Error;

            fn try_from(value: &Value) -> Result<Self, Self::Error> {
                match value {
                    Value::String(s) => <$type as FromStr>::from_str(s).map_err(|_| sql::Error {
                        code: None,
                        message: Some(format!(
                            "sql: invalid value {s:?} for {}",
                            stringify!($type)
                        )),
                    }),
                    _ => Err(sql::Error {
                        code: None,
                        message: Some(format!(
                            "sql: unexpected column type for {}",
                            stringify!($type)
                        )),
                    }),
                }
            }
        }
    };
}

impl_sql_str!(DocumentId);
impl_sql_str!(ProposalId);
impl_sql_str!(ThreadId);
impl_sql_str!(AnnotationId);
impl_sql_str!(ActorId);
impl_sql_str!(SpaceId);
impl_sql_str!(ChangeId);
impl_sql_str!(proposal::Status);
impl_sql_str!(thread::Kind);
impl_sql_str!(thread::Visibility);
impl_sql_str!(thread::Status);
impl_sql_str!(thread::Outcome);
impl_sql_str!(approval::Role);
impl_sql_str!(approval::Status);
impl_sql_str!(gate::ReviewState);
impl_sql_str!(audit::Kind);
