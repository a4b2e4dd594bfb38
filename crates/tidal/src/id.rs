use serde::{Deserialize, Serialize};

macro_rules! id {
    ($($id:ident),*$(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
            #[serde(transparent)]
            #[repr(transparent)]
            pub struct $id(u64);

            impl From<u64> for $id {
                fn from(value: u64) -> Self {
                    Self(value)
                }
            }

            impl ::std::fmt::Display for $id {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    self.0.fmt(f)
                }
            }
        )*
    };
}

macro_rules! str_id {
    ($($id:ident),*$(,)?) => {
        $(
            #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
            #[serde(transparent)]
            pub struct $id(String);

            impl $id {
                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl From<String> for $id {
                fn from(value: String) -> Self {
                    Self(value)
                }
            }

            impl From<&str> for $id {
                fn from(value: &str) -> Self {
                    Self(value.to_owned())
                }
            }

            impl ::std::fmt::Display for $id {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    self.0.fmt(f)
                }
            }
        )*
    };
}

id![TrackId, AlbumId, ArtistId];
str_id![PlaylistId, MixId];
