//! Pick objects of one kind out of a mixed manifest.

use crate::object::{Gvk, Object};

/// Objects matching `pred`, cloned in input order.
pub fn filter<P>(objects: &[Object], pred: P) -> Vec<Object>
where
    P: Fn(&Object) -> bool,
{
    objects.iter().filter(|o| pred(o)).cloned().collect()
}

/// Objects whose group, version and kind all equal `gvk`.
pub fn classify_by_kind(objects: &[Object], gvk: &Gvk) -> Vec<Object> {
    filter(objects, |o| o.is_kind(gvk))
}

pub fn subscriptions(objects: &[Object]) -> Vec<Object> {
    classify_by_kind(objects, &Gvk::subscription())
}
