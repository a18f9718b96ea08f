mod json;

pub use self::json::JsonDb;
