//! Logging shim: forwards to `defmt` when the feature is enabled and
//! compiles to nothing otherwise.

#![allow(unused_macros)]

macro_rules! debug {
    ($($arg:expr),* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::debug!($($arg),*);
            #[cfg(not(feature = "defmt"))]
            { $( let _ = &$arg; )* }
        }
    };
}

macro_rules! info {
    ($($arg:expr),* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::info!($($arg),*);
            #[cfg(not(feature = "defmt"))]
            { $( let _ = &$arg; )* }
        }
    };
}

macro_rules! warning {
    ($($arg:expr),* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::warn!($($arg),*);
            #[cfg(not(feature = "defmt"))]
            { $( let _ = &$arg; )* }
        }
    };
}
