//! Esquema Diesel (escrito a mano). Reemplazable con `diesel print-schema`.

diesel::table! {
    events (id) {
        id -> BigInt,
        state_machine_instance_id -> Text,
        name -> Text,
        event_type -> Text,
        status -> Text,
        event_data -> Nullable<Text>,
        event_source -> Nullable<Text>,
        originating_state -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
