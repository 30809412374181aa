// Per-tenant database schema. Every tenant database carries an
// identical copy of these tables; they never exist in the central
// database.

diesel::table! {
    model_has_roles (model_type, model_id) {
        #[max_length = 64]
        model_type -> Varchar,
        model_id -> Uuid,
        role_id -> Int4,
    }
}

diesel::table! {
    permissions (id) {
        id -> Int4,
        #[max_length = 128]
        name -> Varchar,
        #[max_length = 64]
        guard_name -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    quota_overrides (user_id) {
        user_id -> Uuid,
        max_documents -> Nullable<Int4>,
        max_signatures -> Nullable<Int4>,
        max_storage_bytes -> Nullable<Int8>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    quota_settings (id) {
        id -> Int4,
        max_documents -> Nullable<Int4>,
        max_signatures -> Nullable<Int4>,
        max_storage_bytes -> Nullable<Int8>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    quota_usages (id) {
        id -> Int4,
        used_documents -> Int4,
        used_signatures -> Int4,
        used_storage_bytes -> Int8,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    role_permissions (role_id, permission_id) {
        role_id -> Int4,
        permission_id -> Int4,
    }
}

diesel::table! {
    roles (id) {
        id -> Int4,
        #[max_length = 64]
        name -> Varchar,
        #[max_length = 64]
        guard_name -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    root_certificate_authorities (id) {
        id -> Int4,
        #[max_length = 16]
        status -> Varchar,
        certificate_path -> Text,
        private_key_path -> Text,
        not_before -> Timestamptz,
        not_after -> Timestamptz,
        last_serial_number -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    oauth_clients (id) {
        id -> Uuid,
        #[max_length = 255]
        name -> Varchar,
        #[max_length = 255]
        secret_hash -> Varchar,
        redirect_uri -> Text,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(model_has_roles -> roles (role_id));
diesel::joinable!(role_permissions -> roles (role_id));
diesel::joinable!(role_permissions -> permissions (permission_id));

diesel::allow_tables_to_appear_in_same_query!(
    model_has_roles,
    permissions,
    quota_overrides,
    quota_settings,
    quota_usages,
    role_permissions,
    roles,
    root_certificate_authorities,
    oauth_clients,
);
