//! Procedural macros for svclink - service interface declarations

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod interface;

/// Derive `svclink::ServiceInterface` for a unit-only enum.
///
/// ```rust,ignore
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, ServiceInterface)]
/// #[service(name = "Lights", version = "1.2.0")]
/// enum Lights {
///     #[request(response = Switched)]
///     Switch,
///     #[request]
///     Blink,
///     #[response]
///     Switched,
///     #[broadcast]
///     PowerLost,
///     #[attribute]
///     Brightness,
/// }
/// ```
///
/// Ids are numbered per role in declaration order; broadcasts share the
/// response range.
#[proc_macro_derive(
    ServiceInterface,
    attributes(service, request, response, broadcast, attribute)
)]
pub fn service_interface(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    interface::derive_service_interface(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
