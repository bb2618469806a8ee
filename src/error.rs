use thiserror::Error;

/// Errors raised by the variable/namespace scope service.
///
/// Everything except [`ScopeError::Internal`] is a usage error: the query
/// author referenced something that does not exist or is not visible.
/// `Internal` signals a bug in the code driving the scope service (for
/// example mutating a finalized namespace) and is never caused by query text.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScopeError {
    #[error("variable is not defined: {name}")]
    NotDefined { name: String },

    #[error("variable is hidden in this scope: {name}")]
    Hidden { name: String },

    #[error("cannot shadow mutable variable {name}")]
    ShadowMutable { name: String },

    #[error("invalid variable reference: {reference}")]
    InvalidName { reference: String },

    #[error("module {name} already registered at {existing}, conflicting with {offered}")]
    ModuleConflict {
        name: String,
        existing: String,
        offered: String,
    },

    #[error("variable {name} is not exported by namespace {namespace}")]
    NotExported { name: String, namespace: String },

    /// Invariant violation in the caller, not a user error.
    #[error("internal scope invariant violated: {0}")]
    Internal(String),
}

/// Errors raised while compiling a multi-way join specification.
///
/// All variants except [`PlanError::Internal`] are usage errors: the join
/// specification handed to the planner is malformed. Planning is pure, so the
/// same input always reproduces the same error.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanError {
    #[error("only equality predicates are supported by join")]
    NonEquality,

    #[error("join predicate must reference exactly one variable on each side")]
    PredicateShape,

    #[error("join predicate relates input {var} to itself")]
    SelfReference { var: String },

    #[error("join predicate references a variable outside the join inputs")]
    OutsideInputs,

    #[error("join graph must be fully connected; {input} is not connected to the first input")]
    Disconnected { input: String },

    #[error("preserving joins must be acyclic (tree/star/snowflake) or on a single key")]
    PreservedCycle,

    /// Invariant violation inside the planner, not a user error.
    #[error("internal planner invariant violated: {0}")]
    Internal(String),
}

/// Errors raised while executing a compiled expression tree.
///
/// These propagate unconditionally up the evaluation call chain; the planner
/// introduces no interception of its own.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("type error: {0}")]
    TypeError(String),

    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("duplicate field name: {0}")]
    DuplicateField(String),
}

/// Any error the compile core can produce.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Eval(#[from] EvalError),
}
