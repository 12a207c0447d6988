//! Diesel table definitions for the relational reference backend (spec.md §4.2's logical
//! schema). Column names inside the database still carry the field's historical short name
//! (`userid`, `collection`, `ttl`) via `#[sql_name]`; Rust-side names follow what the rest of
//! this crate calls them.

table! {
    batch_uploads (batch_id, user_id) {
        #[sql_name = "batch"]
        batch_id -> Bigint,
        #[sql_name = "userid"]
        user_id -> Bigint,
        #[sql_name = "collection"]
        collection_id -> Integer,
    }
}

table! {
    batch_upload_items (batch_id, user_id, id) {
        #[sql_name = "batch"]
        batch_id -> Bigint,
        #[sql_name = "userid"]
        user_id -> Bigint,
        id -> Varchar,
        sortindex -> Nullable<Integer>,
        payload -> Nullable<Mediumtext>,
        payload_size -> Nullable<Bigint>,
        ttl_offset -> Nullable<Integer>,
    }
}

table! {
    bso (user_id, collection_id, id) {
        #[sql_name = "userid"]
        user_id -> BigInt,
        #[sql_name = "collection"]
        collection_id -> Integer,
        id -> Varchar,
        sortindex -> Nullable<Integer>,
        payload -> Mediumtext,
        payload_size -> Bigint,
        modified -> Bigint,
        /// Centiseconds since epoch after which the row is invisible to reads/deletes (§4.2
        /// TTL). Stored under its legacy column name.
        #[sql_name = "ttl"]
        expiry -> Bigint,
    }
}

table! {
    collections (id) {
        id -> Integer,
        name -> Varchar,
    }
}

table! {
    user_collections (user_id, collection_id) {
        #[sql_name = "userid"]
        user_id -> BigInt,
        #[sql_name = "collection"]
        collection_id -> Integer,
        #[sql_name = "last_modified"]
        modified -> Bigint,
        #[sql_name = "count"]
        count -> Integer,
        #[sql_name = "total_bytes"]
        total_bytes -> BigInt,
    }
}

allow_tables_to_appear_in_same_query!(
    batch_uploads,
    batch_upload_items,
    bso,
    collections,
    user_collections,
);
