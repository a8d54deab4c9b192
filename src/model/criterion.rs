use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::model::{Bean, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriterionOperator {
    Eq,
    NotEq,
    Lt,
    Gt,
    In,
    NotIn,
}

/// Predicate over one bean property path
#[derive(Clone)]
pub enum Criterion {
    Basic {
        path: String,
        operator: CriterionOperator,
        values: Vec<Value>,
    },
    Function {
        name: String,
        predicate: Arc<dyn Fn(&Bean) -> bool + Send + Sync>,
    },
}

impl Criterion {
    pub fn basic(path: &str, operator: CriterionOperator, values: Vec<Value>) -> Self {
        Criterion::Basic {
            path: path.to_string(),
            operator,
            values,
        }
    }

    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Self::basic(path, CriterionOperator::Eq, vec![value.into()])
    }

    pub fn function<F>(name: &str, predicate: F) -> Self
    where
        F: Fn(&Bean) -> bool + Send + Sync + 'static,
    {
        Criterion::Function {
            name: name.to_string(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn evaluate(&self, bean: &Bean) -> bool {
        match self {
            Criterion::Basic {
                path,
                operator,
                values,
            } => {
                let actual = bean.get_path(path);
                let contained = values.iter().any(|v| *v == actual);
                match operator {
                    CriterionOperator::Eq | CriterionOperator::In => contained,
                    CriterionOperator::NotEq | CriterionOperator::NotIn => !contained,
                    CriterionOperator::Lt => values
                        .first()
                        .is_some_and(|v| compare(&actual, v) == Some(Ordering::Less)),
                    CriterionOperator::Gt => values
                        .first()
                        .is_some_and(|v| compare(&actual, v) == Some(Ordering::Greater)),
                }
            }
            Criterion::Function { predicate, .. } => predicate(bean),
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

impl fmt::Debug for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::Basic {
                path,
                operator,
                values,
            } => write!(f, "{} {:?} {:?}", path, operator, values),
            Criterion::Function { name, .. } => write!(f, "fn {}", name),
        }
    }
}

/// Named conjunction of criteria. An empty group matches every bean.
#[derive(Debug, Clone)]
pub struct CriterionGroup {
    pub name: String,
    pub criteria: Vec<Criterion>,
}

impl CriterionGroup {
    pub fn new(name: &str, criteria: Vec<Criterion>) -> Self {
        Self {
            name: name.to_string(),
            criteria,
        }
    }

    pub fn all() -> Self {
        Self::new("ALL", Vec::new())
    }

    pub fn is_all(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn evaluate(&self, bean: &Bean) -> bool {
        self.criteria.iter().all(|c| c.evaluate(bean))
    }
}
