#[allow(unused_imports)]
pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    pub(crate) use loom::{model, sync, thread};
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code)]

    pub(crate) mod sync {
        pub(crate) use nohz_util::sync::atomic;

        #[cfg(test)]
        pub(crate) use std::sync::Arc;
    }


    #[cfg(test)]
    pub(crate) fn model(f: impl Fn()) {
        let _trace = crate::test_util::trace_init();
        f()
    }
}
