//! Metrics and structured logs emitted by the admission engine.
//!
//! Events are registered once, which resolves their metric handles, and then
//! emitted many times with typed data.

mod admission;

pub use admission::*;

/// An event whose metric handles are resolved up front.
pub trait RegisterInternalEvent: Sized {
    type Handle: InternalEventHandle;

    fn register(self) -> Self::Handle;
}

pub trait InternalEventHandle: Sized {
    type Data: Sized;

    fn emit(&self, data: Self::Data);
}

/// Declares a registered event and its handle type.
///
/// ```ignore
/// registered_event! {
///     MyEvent => {
///         total: Counter = counter!("my_event_total"),
///     }
///
///     fn emit(&self, count: u64) {
///         self.total.increment(count);
///     }
/// }
/// ```
#[macro_export]
macro_rules! registered_event {
    (
        $event:ident => {
            $( $field:ident: $type:ty = $value:expr, )*
        }

        fn emit(&$slf:ident, $data_name:ident: $data:ty) $emit_body:block
    ) => {
        paste::paste! {
            #[derive(Debug, Clone, Copy)]
            pub struct $event;

            #[derive(Clone)]
            pub struct [<$event Handle>] {
                $( $field: $type, )*
            }

            impl $crate::admission::internal_event::RegisterInternalEvent for $event {
                type Handle = [<$event Handle>];

                fn register(self) -> Self::Handle {
                    [<$event Handle>] {
                        $( $field: $value, )*
                    }
                }
            }

            impl $crate::admission::internal_event::InternalEventHandle for [<$event Handle>] {
                type Data = $data;

                fn emit(&$slf, $data_name: $data) $emit_body
            }
        }
    };
}
