//! Набор универсальных макросов для приложений Courier.
use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Data, DeriveInput, Fields, LitStr, Token};

/// Derive-макрос для `Enum`: автоматически добавляет реализации
/// [`std::fmt::Display`] и [`std::str::FromStr`], а также метод `variants()`
/// со списком всех вариантов.
///
/// Атрибут `#[str(...)]` принимает одно или несколько строковых значений.
/// Первое используется для `Display`, остальные — допустимые синонимы при
/// разборе строки. Сравнение при разборе не учитывает регистр. Без атрибута
/// используется имя варианта в нижнем регистре.
///
/// Ошибка разбора — `CourierError::ValueError`, поэтому тип `CourierError`
/// должен быть в области видимости.
///
/// ## Пример
///
/// ```ignore
/// use commons::errors::CourierError;
/// use macros::EnumDisplay;
///
/// #[derive(Debug, Clone, EnumDisplay)]
/// enum ServiceType {
///     #[str("SAME_DAY", "same-day")]
///     SameDay,
///     #[str("INSTANT")]
///     Instant,
/// }
///
/// assert_eq!(ServiceType::SameDay.to_string(), "SAME_DAY");
/// assert!("same-day".parse::<ServiceType>().is_ok());
/// ```
#[proc_macro_derive(EnumDisplay, attributes(str))]
pub fn derive_enum_display(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let variants = match input.data {
        Data::Enum(e) => e.variants,
        _ => panic!("EnumDisplay допустимо использовать только с enum"),
    };

    let mut to_arms = Vec::new();
    let mut from_arms = Vec::new();
    let mut all = Vec::new();

    for v in variants {
        let ident = v.ident;
        if !matches!(v.fields, Fields::Unit) {
            panic!("Только unit-variants");
        }

        let mut literals: Vec<String> = Vec::new();
        for attr in v.attrs {
            if attr.path().is_ident("str") {
                let parsed = attr
                    .parse_args_with(Punctuated::<LitStr, Token![,]>::parse_terminated)
                    .expect("str(\"...\", ...)");
                literals.extend(parsed.iter().map(LitStr::value));
            }
        }
        if literals.is_empty() {
            literals.push(ident.to_string().to_lowercase());
        }

        let display = LitStr::new(&literals[0], proc_macro2::Span::call_site());
        let patterns: Vec<LitStr> = match_patterns(&literals)
            .iter()
            .map(|s| LitStr::new(s, proc_macro2::Span::call_site()))
            .collect();

        to_arms.push(quote! { #name::#ident => write!(f, #display), });
        from_arms.push(quote! { #(#patterns)|* => Ok(#name::#ident), });
        all.push(quote! { #name::#ident });
    }

    let expanded = quote! {
        impl std::fmt::Display for #name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                match self { #(#to_arms)* }
            }
        }

        impl std::str::FromStr for #name {
            type Err = CourierError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    #(#from_arms)*
                    _ => Err(CourierError::value_err(format!(
                        "некорректное значение {}: {}",
                        stringify!(#name), s
                    ))),
                }
            }
        }

        impl #name {
            /// Все варианты перечисления в порядке объявления.
            pub fn variants() -> &'static [#name] {
                &[#(#all),*]
            }
        }
    };

    TokenStream::from(expanded)
}

/// Образцы для `FromStr`: строки в нижнем регистре без повторов, в порядке
/// объявления.
fn match_patterns(literals: &[String]) -> Vec<String> {
    let mut patterns: Vec<String> = Vec::with_capacity(literals.len());
    for literal in literals {
        let lowered = literal.to_lowercase();
        if !patterns.contains(&lowered) {
            patterns.push(lowered);
        }
    }
    patterns
}
