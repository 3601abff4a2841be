//! Defines the id types used within circuits

use serde::{Deserialize, Serialize};
use std::{
    cell::Cell,
    fmt::{self, Debug, Display},
    num::NonZeroU32,
    str::FromStr,
};

/// Creates an id type and a corresponding id generator
macro_rules! create_ids {
    ($($name:ident = $prefix:literal),* $(,)?) => {
        ::paste::paste! {
            $(
                #[derive(
                    Clone,
                    Copy,
                    PartialEq,
                    Eq,
                    PartialOrd,
                    Ord,
                    Hash,
                    Deserialize,
                    Serialize,
                )]
                #[serde(transparent)]
                #[repr(transparent)]
                pub struct $name(NonZeroU32);

                #[allow(dead_code)]
                impl $name {
                    /// Creates an id from its raw value
                    ///
                    /// # Panics
                    ///
                    /// Panics if `id` is zero
                    #[inline]
                    pub fn new(id: u32) -> Self {
                        match NonZeroU32::new(id) {
                            Some(id) => Self(id),
                            None => panic!(concat!("created a ", stringify!($name), " from an id of zero")),
                        }
                    }

                    #[inline]
                    pub const fn into_inner(self) -> u32 {
                        self.0.get()
                    }
                }

                impl FromStr for $name {
                    type Err = <NonZeroU32 as FromStr>::Err;

                    #[inline]
                    fn from_str(string: &str) -> Result<Self, Self::Err> {
                        Ok(Self(string.trim_start_matches($prefix).parse()?))
                    }
                }

                impl Debug for $name {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        Display::fmt(self, f)
                    }
                }

                impl Display for $name {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, concat!($prefix, "{}"), self.0.get())
                    }
                }

                #[doc = "A generator for [`" $name "`]s"]
                pub struct [<$name Gen>] {
                    id: Cell<u32>,
                }

                #[allow(dead_code)]
                impl [<$name Gen>] {
                    #[doc = "Creates a new `" [<$name Gen>] "` to generate [`" $name "`]s"]
                    #[inline]
                    pub const fn new() -> Self {
                        Self {
                            id: Cell::new(1),
                        }
                    }

                    #[doc = "Creates a generator whose first id comes after `id`"]
                    #[inline]
                    pub fn after_id(id: $name) -> Self {
                        Self {
                            id: Cell::new(match id.into_inner().checked_add(1) {
                                Some(id) => id,
                                None => id_generator_overflow(stringify!($name)),
                            }),
                        }
                    }

                    #[doc = "Generates the next [`" $name "`]\n\n## Panics\n\nPanics if more than `2³²-1` ids are created"]
                    #[inline]
                    pub fn next(&self) -> $name {
                        let id = self.id.get();
                        self.id.set(match id.checked_add(1) {
                            Some(id) => id,
                            None => id_generator_overflow(stringify!($name)),
                        });

                        $name::new(id)
                    }

                    /// Makes sure every id generated from now on is greater than `id`
                    #[inline]
                    pub fn skip_past(&self, id: $name) {
                        if self.id.get() <= id.into_inner() {
                            self.id.set(match id.into_inner().checked_add(1) {
                                Some(id) => id,
                                None => id_generator_overflow(stringify!($name)),
                            });
                        }
                    }
                }

                impl Default for [<$name Gen>] {
                    fn default() -> Self {
                        Self::new()
                    }
                }

                impl Clone for [<$name Gen>] {
                    fn clone(&self) -> Self {
                        Self {
                            id: Cell::new(self.id.get()),
                        }
                    }
                }

                impl Debug for [<$name Gen>] {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.debug_struct(stringify!([<$name Gen>]))
                            .field("next", &self.id.get())
                            .finish()
                    }
                }
            )*
        }

        #[cold]
        #[inline(never)]
        fn id_generator_overflow(id: &'static str) -> ! {
            panic!("created more than {} {id}s", u32::MAX - 1)
        }
    };
}

create_ids! {
    OperatorId = "op",
}

#[cfg(test)]
mod tests {
    use super::{OperatorId, OperatorIdGen};

    #[test]
    fn generator_is_sequential() {
        let ids = OperatorIdGen::new();
        assert_eq!(ids.next(), OperatorId::new(1));
        assert_eq!(ids.next(), OperatorId::new(2));

        ids.skip_past(OperatorId::new(10));
        assert_eq!(ids.next(), OperatorId::new(11));

        // Skipping backwards is a no-op
        ids.skip_past(OperatorId::new(3));
        assert_eq!(ids.next(), OperatorId::new(12));
    }

    #[test]
    fn display_and_parse() {
        let id = OperatorId::new(42);
        assert_eq!(id.to_string(), "op42");
        assert_eq!("op42".parse::<OperatorId>().unwrap(), id);
    }
}
