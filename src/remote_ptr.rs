use std::{
    fmt::{self, Display, Formatter},
    marker::PhantomData,
};

/// Referent of untyped tracee memory.
pub type Void = u8;

/// An address in a tracee's address space. It is never dereferenced
/// locally; only the tracee memory accessors take one.
#[derive(Debug)]
pub struct RemotePtr<T> {
    ptr: usize,
    phantom: PhantomData<*const T>,
}

impl<T> RemotePtr<T> {
    pub fn as_usize(&self) -> usize {
        self.ptr
    }
}

// Manual impls: deriving would put bounds on `T`.
impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RemotePtr<T> {}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for RemotePtr<T> {}

impl<T> From<usize> for RemotePtr<T> {
    fn from(addr: usize) -> Self {
        RemotePtr {
            ptr: addr,
            phantom: PhantomData,
        }
    }
}

impl<T> Display for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_addresses_only() {
        assert_eq!(RemotePtr::<u64>::from(0x1000), RemotePtr::<u64>::from(0x1000));
        assert_eq!(0x1003, RemotePtr::<Void>::from(0x1003).as_usize());
    }

    #[test]
    fn displayed_in_hex() {
        assert_eq!("0xdead", RemotePtr::<Void>::from(0xdead).to_string());
    }
}
