/// Result of a delete against any of the three stores.
///
/// Deleting something that is already gone is not an error: callers log it
/// and carry on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}
