use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Error, Fields, GenericArgument, Ident, PathArguments, ReturnType,
    Type, TypePath, parse_macro_input, spanned::Spanned,
};

/// Derive macro for the `ShmSafe` plain-data marker trait.
///
/// Generates `unsafe impl ShmSafe` after verifying, at compile time, that the
/// type is plain data: a stable layout and no fields that smuggle in a
/// process-local pointer.
///
/// # Compile-Time Checks
///
/// 1. **Stable layout**: `#[repr(C)]`, `#[repr(transparent)]`, or an integer
///    repr for enums. Rust's default layout may differ between builds, so it
///    is not acceptable for memory another process (or a raw byte copy)
///    observes.
/// 2. **No pointer-bearing fields**: `Vec`, `Box`, `String`, `PathBuf`,
///    `OsString`, `CString`, `Rc`, `Arc`, references, raw pointers, and
///    process-local sync primitives (`Mutex`, `RwLock`, `Condvar`, `Barrier`)
///    are rejected wherever they appear in a field's type.
/// 3. **Recursive safety**: every field type must itself be `ShmSafe`,
///    enforced through generated where-clauses.
///
/// # Safety
///
/// The generated impl is `unsafe` because the remaining obligations cannot be
/// machine-checked: the type must tolerate concurrent access through shared
/// mappings (atomics for mutable state) and must not rely on `Drop` running
/// (a crashed process never drops).
///
/// # Example
///
/// ```
/// # use rhea::ShmSafe;
/// #[derive(ShmSafe, Clone, Copy)]
/// #[repr(C)]
/// struct Sample {
///     channel: u32,
///     value: f64,
/// }
/// ```
///
/// ```compile_fail
/// # use rhea::ShmSafe;
/// #[derive(ShmSafe)]
/// #[repr(C)]
/// struct Leaky {
///     samples: Vec<f64>, // heap pointer, rejected
/// }
/// ```
#[proc_macro_derive(ShmSafe)]
pub fn derive_shm_safe(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    require_stable_repr(&input)?;

    let field_types = field_types(&input.data)?;
    field_types.iter().try_for_each(reject_pointer_types)?;

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let trait_path = resolve_trait_path();

    let mut predicates = where_clause
        .map(|w| w.predicates.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    for ty in &field_types {
        predicates.push(syn::parse_quote!(#ty: #trait_path));
    }

    let expanded = if predicates.is_empty() {
        quote! {
            unsafe impl #impl_generics #trait_path for #name #ty_generics #where_clause {}
        }
    } else {
        quote! {
            unsafe impl #impl_generics #trait_path for #name #ty_generics
            where
                #(#predicates),*
            {}
        }
    };

    Ok(expanded.into())
}

/// Resolves `::rhea::__ShmSafePrivate` even when the host crate renamed rhea.
fn resolve_trait_path() -> proc_macro2::TokenStream {
    match crate_name("rhea") {
        Ok(FoundCrate::Itself) => quote!(::rhea::__ShmSafePrivate),
        Ok(FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident::__ShmSafePrivate)
        }
        Err(_) => quote!(::rhea::__ShmSafePrivate),
    }
}

fn repr_ident_is_stable(ident: &syn::Ident) -> bool {
    const STABLE: &[&str] = &[
        "C", "transparent", "u8", "u16", "u32", "u64", "u128", "usize", "i8", "i16", "i32", "i64",
        "i128", "isize",
    ];
    STABLE.iter().any(|&name| ident == name)
}

fn attr_has_stable_repr(attr: &Attribute) -> syn::Result<bool> {
    if !attr.path().is_ident("repr") {
        return Ok(false);
    }
    let mut stable = false;
    attr.parse_nested_meta(|meta| {
        if let Some(ident) = meta.path.get_ident()
            && repr_ident_is_stable(ident)
        {
            stable = true;
        }
        Ok(())
    })?;
    Ok(stable)
}

fn require_stable_repr(input: &DeriveInput) -> syn::Result<()> {
    for attr in &input.attrs {
        if attr_has_stable_repr(attr)? {
            return Ok(());
        }
    }
    let help = if matches!(input.data, Data::Enum(_)) {
        "ShmSafe requires #[repr(C)], #[repr(transparent)], or an integer repr for enums\n\
         help: add #[repr(C)] or #[repr(u8)] above this item"
    } else {
        "ShmSafe requires #[repr(C)] or #[repr(transparent)]\n\
         help: add #[repr(C)] above this item"
    };
    Err(Error::new(input.span(), help))
}

fn field_types(data: &Data) -> syn::Result<Vec<Type>> {
    fn of_fields(fields: &Fields) -> Vec<Type> {
        match fields {
            Fields::Named(fields) => fields.named.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unnamed(fields) => fields.unnamed.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unit => Vec::new(),
        }
    }

    match data {
        Data::Struct(s) => Ok(of_fields(&s.fields)),
        Data::Enum(e) => Ok(e
            .variants
            .iter()
            .flat_map(|v| of_fields(&v.fields))
            .collect()),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "ShmSafe cannot be derived for unions",
        )),
    }
}

/// Walks a field type and rejects anything that carries a process-local pointer.
fn reject_pointer_types(field_ty: &Type) -> syn::Result<()> {
    fn walk(ty: &Type, field_ty: &Type) -> syn::Result<()> {
        match ty {
            Type::Path(TypePath { path, .. }) => {
                for segment in &path.segments {
                    reject_forbidden_ident(&segment.ident, field_ty, segment.ident.span())?;
                    match &segment.arguments {
                        PathArguments::AngleBracketed(args) => {
                            for arg in &args.args {
                                if let GenericArgument::Type(inner) = arg {
                                    walk(inner, field_ty)?;
                                }
                            }
                        }
                        PathArguments::Parenthesized(args) => {
                            for input in &args.inputs {
                                walk(input, field_ty)?;
                            }
                            if let ReturnType::Type(_, ret) = &args.output {
                                walk(ret, field_ty)?;
                            }
                        }
                        PathArguments::None => {}
                    }
                }
            }
            Type::Reference(r) => {
                return Err(Error::new(
                    r.span(),
                    format!(
                        "Field type `{}` contains a reference.\n\
                         Addresses are process-specific and cannot live in a plain-data record.\n\
                         help: store the data inline instead",
                        quote!(#field_ty),
                    ),
                ));
            }
            Type::Ptr(p) => {
                return Err(Error::new(
                    p.span(),
                    format!(
                        "Field type `{}` contains a raw pointer.\n\
                         Addresses are process-specific and cannot live in a plain-data record.\n\
                         help: store the data inline instead",
                        quote!(#field_ty),
                    ),
                ));
            }
            Type::Tuple(t) => {
                for elem in &t.elems {
                    walk(elem, field_ty)?;
                }
            }
            Type::Array(a) => walk(&a.elem, field_ty)?,
            Type::Slice(s) => walk(&s.elem, field_ty)?,
            Type::Group(g) => walk(&g.elem, field_ty)?,
            Type::Paren(p) => walk(&p.elem, field_ty)?,
            // Remaining variants cannot appear as struct fields or carry no
            // nested types of interest.
            _ => {}
        }
        Ok(())
    }

    walk(field_ty, field_ty)
}

fn reject_forbidden_ident(
    ident: &Ident,
    field_ty: &Type,
    span: proc_macro2::Span,
) -> syn::Result<()> {
    const HEAP: &[&str] = &["Vec", "Box", "String", "PathBuf", "OsString", "CString"];
    const REFCOUNTED: &[&str] = &["Rc", "Arc"];
    const PROCESS_LOCAL: &[&str] = &["Mutex", "RwLock", "Condvar", "Barrier"];

    let msg = if HEAP.iter().any(|&n| ident == n) {
        format!(
            "Field type `{}` contains `{}`, which owns a heap allocation.\n\
             help: use inline data like `[T; N]` instead",
            quote!(#field_ty),
            ident,
        )
    } else if REFCOUNTED.iter().any(|&n| ident == n) {
        format!(
            "Field type `{}` contains `{}`, which is reference-counted.\n\
             help: use inline data or atomics instead",
            quote!(#field_ty),
            ident,
        )
    } else if PROCESS_LOCAL.iter().any(|&n| ident == n) {
        format!(
            "Field type `{}` contains `{}`, which only synchronizes within one process.\n\
             help: use atomic types (AtomicU64, AtomicBool, ...) instead",
            quote!(#field_ty),
            ident,
        )
    } else {
        return Ok(());
    };

    Err(Error::new(span, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn accepts_repr_c_struct() {
        let input: DeriveInput = parse_quote! {
            #[repr(C)]
            struct Sample { channel: u32, value: f64 }
        };
        assert!(require_stable_repr(&input).is_ok());
    }

    #[test]
    fn accepts_repr_transparent() {
        let input: DeriveInput = parse_quote! {
            #[repr(transparent)]
            struct Wrapper(u64);
        };
        assert!(require_stable_repr(&input).is_ok());
    }

    #[test]
    fn accepts_integer_repr_enum() {
        let input: DeriveInput = parse_quote! {
            #[repr(u8)]
            enum Kind { A, B }
        };
        assert!(require_stable_repr(&input).is_ok());
    }

    #[test]
    fn rejects_default_repr() {
        let input: DeriveInput = parse_quote! {
            struct Sample { value: u32 }
        };
        assert!(require_stable_repr(&input).is_err());
    }

    #[test]
    fn accepts_primitives_and_atomics() {
        let types: [Type; 5] = [
            parse_quote!(u64),
            parse_quote!(f32),
            parse_quote!(AtomicU64),
            parse_quote!([u8; 32]),
            parse_quote!(Option<u32>),
        ];
        for ty in &types {
            assert!(reject_pointer_types(ty).is_ok());
        }
    }

    #[test]
    fn rejects_heap_types() {
        let types: [Type; 4] = [
            parse_quote!(Vec<u8>),
            parse_quote!(Box<u32>),
            parse_quote!(String),
            parse_quote!(PathBuf),
        ];
        for ty in &types {
            assert!(reject_pointer_types(ty).is_err());
        }
    }

    #[test]
    fn rejects_refcounted_and_process_local() {
        let types: [Type; 4] = [
            parse_quote!(Rc<u32>),
            parse_quote!(Arc<u32>),
            parse_quote!(Mutex<u32>),
            parse_quote!(Condvar),
        ];
        for ty in &types {
            assert!(reject_pointer_types(ty).is_err());
        }
    }

    #[test]
    fn rejects_references_and_pointers() {
        let types: [Type; 4] = [
            parse_quote!(&u32),
            parse_quote!(&mut u32),
            parse_quote!(*const u32),
            parse_quote!(*mut u32),
        ];
        for ty in &types {
            assert!(reject_pointer_types(ty).is_err());
        }
    }

    #[test]
    fn rejects_nested_pointer_types() {
        let types: [Type; 3] = [
            parse_quote!(Option<Vec<u8>>),
            parse_quote!((u32, Box<u64>)),
            parse_quote!([Mutex<u64>; 4]),
        ];
        for ty in &types {
            assert!(reject_pointer_types(ty).is_err());
        }
    }

    #[test]
    fn collects_field_types_from_structs_and_enums() {
        let s: DeriveInput = parse_quote! {
            struct Pair { a: u32, b: u64 }
        };
        assert_eq!(field_types(&s.data).unwrap().len(), 2);

        let e: DeriveInput = parse_quote! {
            enum Either { L(u32), R { x: u64 }, None }
        };
        assert_eq!(field_types(&e.data).unwrap().len(), 2);
    }

    #[test]
    fn rejects_unions() {
        let u: DeriveInput = parse_quote! {
            union Bits { x: u32, y: f32 }
        };
        assert!(field_types(&u.data).is_err());
    }
}
