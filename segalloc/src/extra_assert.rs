//! Assertions that only run with the "extra_assertions" feature.
//!
//! Without the feature every macro here expands to code that type checks its
//! arguments and is then thrown away by the optimizer.

#[cfg(feature = "extra_assertions")]
macro_rules! extra_assert {
    ( $condition:expr $( , $args:expr )* ) => {
        assert!($condition $( , $args )* )
    }
}

#[cfg(not(feature = "extra_assertions"))]
macro_rules! extra_assert {
    ( $condition:expr $( , $args:expr )* ) => {
        if false {
            let _ = $condition;
            $( let _ = $args; )*
        }
    }
}

/// Define a function that only does anything when the "extra_assertions"
/// feature is enabled.
///
/// When that feature is not enabled, then the function is a no-op that is
/// marked `#[inline(always)]` and should completely disappear in the final
/// compilation artifact.
macro_rules! extra_only {
    (
        $vis:vis fn $name:ident ( $( $arg:ident : $arg_ty:ty ),* $(,)* ) {
            $( $body:tt )*
        }
    ) => {
        #[cfg(feature = "extra_assertions")]
        $vis fn $name ( $($arg : $arg_ty),* ) {
            $( $body )*
        }

        #[cfg(not(feature = "extra_assertions"))]
        #[inline(always)]
        #[allow(dead_code)]
        $vis fn $name ( $($arg : $arg_ty),* ) {
            $( let _ = $arg; )*
        }
    }
}

extra_only! {
    // Run the whole heap checker and panic with a dump on the first broken
    // invariant. O(heap size); only meant for debugging builds.
    pub(crate) fn assert_heap_consistent(mem: &[u8], tag: &str) {
        if let Err(violation) = crate::check::check_heap(mem) {
            panic!(
                "{}: heap invariant violated: {}\n{}",
                tag,
                violation,
                crate::check::HeapDump::new(mem)
            );
        }
    }
}
