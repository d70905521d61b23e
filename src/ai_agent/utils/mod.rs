pub mod analysts;
