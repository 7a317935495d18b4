//! UUID v7 helpers.
//!
//! Items, notes, and jobs use UUIDv7 identifiers, which embed a millisecond
//! timestamp in the first 48 bits so ids sort in creation order.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use intake_core::uuid_utils::new_v7;
///
/// let id = new_v7();
/// assert_eq!(id.get_version_num(), 7);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}
