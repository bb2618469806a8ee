pub mod error;
pub mod evaluator;
pub mod expr;
pub mod planner;
pub mod scope;
pub mod value;

pub use error::{Error, EvalError, PlanError, ScopeError};
pub use evaluator::{Context, Evaluator, Slot, ValueStream};
pub use expr::{BindingKind, CompareOp, ExprArena, ExprId, ExprKind, RecordField};
pub use planner::plan;
pub use scope::{ModuleRegistry, Mutability, NamespaceId, Scopes, Var, VarId};
pub use value::{JoinKey, Value};
