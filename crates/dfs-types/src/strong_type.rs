/// Macro to create a strongly-typed 128-bit identifier backed by a [`uuid::Uuid`].
///
/// The generated type implements:
/// - `Deref` to `Uuid`
/// - `From<Uuid>` and `Into<Uuid>`
/// - `Display` (hyphenated lowercase) and `Debug` (`Name(uuid)`)
/// - `FromStr`, accepting any textual form `Uuid` accepts
/// - `Clone`, `Copy`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`, `Default`
/// - `serde::Serialize` and `serde::Deserialize` (transparent)
///
/// It also provides `new_random`, `from_bytes` and `to_bytes` for the 16-byte
/// wire representation.
#[macro_export]
macro_rules! strong_uuid {
    ($name:ident) => {
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub ::uuid::Uuid);

        impl $name {
            /// Generate a fresh random (v4) identifier.
            pub fn new_random() -> Self {
                Self(::uuid::Uuid::new_v4())
            }

            /// Build an identifier from its 16-byte big-endian representation.
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(::uuid::Uuid::from_bytes(bytes))
            }

            /// Return the 16-byte big-endian representation.
            pub fn to_bytes(&self) -> [u8; 16] {
                *self.0.as_bytes()
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = ::uuid::Uuid;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = ::uuid::Error;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                ::uuid::Uuid::parse_str(s).map(Self)
            }
        }

        impl From<::uuid::Uuid> for $name {
            #[inline]
            fn from(val: ::uuid::Uuid) -> Self {
                Self(val)
            }
        }

        impl From<$name> for ::uuid::Uuid {
            #[inline]
            fn from(val: $name) -> Self {
                val.0
            }
        }
    };
}
