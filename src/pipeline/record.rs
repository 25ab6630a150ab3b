//! Runtime-typed records flowing between stages.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Anything a stage can emit or receive.
pub type Record = Arc<dyn Any + Send + Sync>;

pub fn record<T: Any + Send + Sync>(value: T) -> Record {
    Arc::new(value)
}

type Predicate = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync>;

/// Matches records by runtime type.
///
/// `of::<T>()` is an exact type match. `matching` groups several types
/// behind one predicate, e.g. every record that carries properties.
#[derive(Clone)]
pub struct RecordType {
    name: String,
    predicate: Option<Predicate>,
}

fn is<T: Any>(value: &(dyn Any + Send + Sync)) -> bool {
    value.is::<T>()
}

impl RecordType {
    pub fn of<T: Any>() -> Self {
        Self {
            name: std::any::type_name::<T>().to_owned(),
            predicate: Some(Arc::new(is::<T>)),
        }
    }

    /// Matches every record.
    pub fn any() -> Self {
        Self { name: "*".to_owned(), predicate: None }
    }

    pub fn matching(
        name: impl Into<String>,
        predicate: impl Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), predicate: Some(Arc::new(predicate)) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, record: &Record) -> bool {
        match &self.predicate {
            None => true,
            Some(predicate) => predicate(&**record),
        }
    }
}

impl fmt::Debug for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordType({})", self.name)
    }
}

/// What `process` hands back to its stage.
///
/// Batches are flattened recursively; a record whose payload is itself a
/// `Vec<Record>` is flattened the same way.
#[derive(Default)]
pub enum Emit {
    #[default]
    Nothing,
    Record(Record),
    Batch(Vec<Emit>),
}

impl Emit {
    pub fn record<T: Any + Send + Sync>(value: T) -> Self {
        Emit::Record(Arc::new(value))
    }
}

impl From<Record> for Emit {
    fn from(record: Record) -> Self {
        Emit::Record(record)
    }
}

impl From<Option<Record>> for Emit {
    fn from(record: Option<Record>) -> Self {
        record.map_or(Emit::Nothing, Emit::Record)
    }
}

impl From<Vec<Record>> for Emit {
    fn from(records: Vec<Record>) -> Self {
        Emit::Batch(records.into_iter().map(Emit::Record).collect())
    }
}

impl fmt::Debug for Emit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Emit::Nothing => write!(f, "Nothing"),
            Emit::Record(_) => write!(f, "Record"),
            Emit::Batch(items) => f.debug_list().entries(items).finish(),
        }
    }
}
