//! User context carried by a request and handed back through notifications.

use std::any::Any;
use std::rc::Rc;

/// Three-way tagged union for request correlation: a plain integer, an
/// opaque pointer, or a shared object handle. Reading the inactive variant
/// is a programming error.
#[derive(Clone)]
pub enum RequestContext {
    None,
    Integer(u64),
    Pointer(*const ()),
    Object(Rc<dyn Any>),
}

impl RequestContext {
    pub fn integer(&self) -> u64 {
        match self {
            RequestContext::Integer(value) => *value,
            _ => panic!("Request context does not hold an integer"),
        }
    }

    pub fn pointer(&self) -> *const () {
        match self {
            RequestContext::Pointer(value) => *value,
            _ => panic!("Request context does not hold a pointer"),
        }
    }

    pub fn object(&self) -> &Rc<dyn Any> {
        match self {
            RequestContext::Object(value) => value,
            _ => panic!("Request context does not hold an object"),
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, RequestContext::None)
    }
}

impl Default for RequestContext {
    fn default() -> RequestContext {
        RequestContext::None
    }
}
