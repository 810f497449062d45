//! ServiceInterface derive implementation

use proc_macro2::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, Ident, LitStr, Meta};

const REQUEST_FIRST: u32 = 0x0000_0001;
const RESPONSE_FIRST: u32 = 0x0000_8001;
const ATTRIBUTE_FIRST: u32 = 0x0001_0001;
/// Ids available per role
const ROLE_CAPACITY: usize = 0x7FFF;

#[derive(Clone)]
enum Role {
    Request(Option<Ident>),
    Response,
    Broadcast,
    Attribute,
}

struct Variant {
    ident: Ident,
    role: Role,
    id: u32,
}

struct Container {
    name: String,
    version: (u16, u16, u16),
    remote: bool,
}

pub fn derive_service_interface(input: DeriveInput) -> syn::Result<TokenStream> {
    let name = &input.ident;
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "ServiceInterface cannot be derived for generic enums",
        ));
    }
    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            name,
            "ServiceInterface can only be derived for enums",
        ));
    };

    let container = parse_container(name, &input.attrs)?;

    let mut variants = Vec::new();
    let (mut requests, mut responses, mut attributes) = (0u32, 0u32, 0u32);
    for variant in &data.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(syn::Error::new_spanned(
                variant,
                "interface variants cannot carry fields",
            ));
        }
        let role = parse_role(variant)?;
        let id = match role {
            Role::Request(_) => {
                requests += 1;
                REQUEST_FIRST + requests - 1
            }
            Role::Response | Role::Broadcast => {
                responses += 1;
                RESPONSE_FIRST + responses - 1
            }
            Role::Attribute => {
                attributes += 1;
                ATTRIBUTE_FIRST + attributes - 1
            }
        };
        variants.push(Variant {
            ident: variant.ident.clone(),
            role,
            id,
        });
    }

    for (count, label) in [
        (requests, "requests"),
        (responses, "responses and broadcasts"),
        (attributes, "attributes"),
    ] {
        if count as usize > ROLE_CAPACITY {
            return Err(syn::Error::new_spanned(
                name,
                format!("too many {label}, at most {ROLE_CAPACITY} are allowed"),
            ));
        }
    }

    let mut builder_calls = Vec::new();
    for variant in &variants {
        let id = variant.id;
        let call = match &variant.role {
            Role::Request(None) => quote! {
                .request(::svclink::MessageId::new(#id), ::core::option::Option::None)
            },
            Role::Request(Some(response)) => {
                let target = variants
                    .iter()
                    .find(|candidate| candidate.ident == *response)
                    .ok_or_else(|| {
                        syn::Error::new_spanned(response, format!("no variant named `{response}`"))
                    })?;
                if !matches!(target.role, Role::Response) {
                    return Err(syn::Error::new_spanned(
                        response,
                        format!("`{response}` is not declared #[response]"),
                    ));
                }
                let response_id = target.id;
                quote! {
                    .request(
                        ::svclink::MessageId::new(#id),
                        ::core::option::Option::Some(::svclink::MessageId::new(#response_id)),
                    )
                }
            }
            Role::Response => quote! { .response(::svclink::MessageId::new(#id)) },
            Role::Broadcast => quote! { .broadcast(::svclink::MessageId::new(#id)) },
            Role::Attribute => quote! { .attribute(::svclink::MessageId::new(#id)) },
        };
        builder_calls.push(call);
    }

    let service_name = &container.name;
    let (major, minor, patch) = container.version;
    let locality = if container.remote {
        quote! { ::svclink::Locality::Remote }
    } else {
        quote! { ::svclink::Locality::Local }
    };
    let idents: Vec<&Ident> = variants.iter().map(|variant| &variant.ident).collect();
    let ids: Vec<u32> = variants.iter().map(|variant| variant.id).collect();

    Ok(quote! {
        impl ::svclink::ServiceInterface for #name {
            fn descriptor() -> ::std::sync::Arc<::svclink::InterfaceDescriptor> {
                static DESCRIPTOR: ::svclink::once_cell::sync::Lazy<
                    ::std::sync::Arc<::svclink::InterfaceDescriptor>,
                > = ::svclink::once_cell::sync::Lazy::new(|| {
                    ::svclink::InterfaceDescriptor::builder(#service_name)
                        .version(::svclink::Version::new(#major, #minor, #patch))
                        .locality(#locality)
                        #(#builder_calls)*
                        .build_unchecked()
                });
                ::std::sync::Arc::clone(&DESCRIPTOR)
            }

            fn id(self) -> ::svclink::MessageId {
                match self {
                    #(Self::#idents => ::svclink::MessageId::new(#ids),)*
                }
            }

            fn from_id(id: ::svclink::MessageId) -> ::core::option::Option<Self> {
                match id.value() {
                    #(#ids => ::core::option::Option::Some(Self::#idents),)*
                    _ => ::core::option::Option::None,
                }
            }
        }

        impl ::core::convert::From<#name> for ::svclink::MessageId {
            fn from(value: #name) -> Self {
                <#name as ::svclink::ServiceInterface>::id(value)
            }
        }
    })
}

/// Parse `#[service(name = "...", version = "x.y.z", remote)]`
fn parse_container(ident: &Ident, attrs: &[Attribute]) -> syn::Result<Container> {
    let mut container = Container {
        name: ident.to_string(),
        version: (1, 0, 0),
        remote: false,
    };
    for attr in attrs.iter().filter(|attr| attr.path().is_ident("service")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                if value.value().trim().is_empty() {
                    return Err(syn::Error::new_spanned(value, "service name is empty"));
                }
                container.name = value.value();
                Ok(())
            } else if meta.path.is_ident("version") {
                let value: LitStr = meta.value()?.parse()?;
                container.version = parse_version(&value)?;
                Ok(())
            } else if meta.path.is_ident("remote") {
                container.remote = true;
                Ok(())
            } else {
                Err(meta.error("expected `name`, `version` or `remote`"))
            }
        })?;
    }
    Ok(container)
}

fn parse_version(value: &LitStr) -> syn::Result<(u16, u16, u16)> {
    let text = value.value();
    let parts: Vec<&str> = text.split('.').collect();
    let numbers: Option<Vec<u16>> = parts.iter().map(|part| part.parse().ok()).collect();
    match numbers.as_deref() {
        Some([major, minor, patch]) => Ok((*major, *minor, *patch)),
        _ => Err(syn::Error::new_spanned(
            value,
            "version must look like \"major.minor.patch\"",
        )),
    }
}

fn parse_role(variant: &syn::Variant) -> syn::Result<Role> {
    let mut role = None;
    for attr in &variant.attrs {
        let parsed = if attr.path().is_ident("request") {
            match &attr.meta {
                Meta::Path(_) => Role::Request(None),
                Meta::List(_) => {
                    let mut response = None;
                    attr.parse_nested_meta(|meta| {
                        if meta.path.is_ident("response") {
                            response = Some(meta.value()?.parse::<Ident>()?);
                            Ok(())
                        } else {
                            Err(meta.error("expected `response = Variant`"))
                        }
                    })?;
                    Role::Request(response)
                }
                Meta::NameValue(_) => {
                    return Err(syn::Error::new_spanned(
                        attr,
                        "use #[request] or #[request(response = Variant)]",
                    ))
                }
            }
        } else if attr.path().is_ident("response") {
            plain(attr, Role::Response)?
        } else if attr.path().is_ident("broadcast") {
            plain(attr, Role::Broadcast)?
        } else if attr.path().is_ident("attribute") {
            plain(attr, Role::Attribute)?
        } else {
            continue;
        };

        if role.replace(parsed).is_some() {
            return Err(syn::Error::new_spanned(
                attr,
                "a variant takes exactly one of #[request], #[response], #[broadcast] or #[attribute]",
            ));
        }
    }

    role.ok_or_else(|| {
        syn::Error::new_spanned(
            &variant.ident,
            "missing #[request], #[response], #[broadcast] or #[attribute]",
        )
    })
}

fn plain(attr: &Attribute, role: Role) -> syn::Result<Role> {
    match attr.meta {
        Meta::Path(_) => Ok(role),
        _ => Err(syn::Error::new_spanned(attr, "this attribute takes no arguments")),
    }
}
