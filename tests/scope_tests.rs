use sorrel_lang::scope::{Mutability, Scopes};
use sorrel_lang::ScopeError;

#[test]
fn shadowing_resolves_to_innermost() {
    let mut scopes = Scopes::new();
    let first = scopes.scope("x").unwrap();
    let second = scopes.scope("x").unwrap();
    assert_ne!(first, second);
    assert_eq!(scopes.inscope("x").unwrap(), second);

    scopes.unscope(second).unwrap();
    assert_eq!(scopes.inscope("x").unwrap(), first);
}

#[test]
fn tagged_lookup_reaches_shadowed_definition() {
    let mut scopes = Scopes::new();
    let tagged = scopes.scope("x#1").unwrap();
    let plain = scopes.scope("x").unwrap();

    assert_eq!(scopes.inscope("x").unwrap(), plain);
    assert_eq!(scopes.inscope("x#1").unwrap(), tagged);
    assert_eq!(scopes.var(tagged).tagged_name(), "x#1");
}

#[test]
fn tagged_lookup_misses_when_no_tag_matches() {
    let mut scopes = Scopes::new();
    scopes.scope("x#1").unwrap();
    assert_eq!(
        scopes.inscope("x#2"),
        Err(ScopeError::NotDefined {
            name: "x#2".to_string()
        })
    );
}

#[test]
fn unscope_splices_out_of_order() {
    let mut scopes = Scopes::new();
    let first = scopes.scope("x").unwrap();
    let second = scopes.scope("x").unwrap();
    let third = scopes.scope("x").unwrap();

    // Rewrites may retire a middle definition first.
    scopes.unscope(second).unwrap();
    assert_eq!(scopes.inscope("x").unwrap(), third);
    scopes.unscope(third).unwrap();
    assert_eq!(scopes.inscope("x").unwrap(), first);

    // Unscoping something already gone is a no-op.
    scopes.unscope(second).unwrap();
    assert_eq!(scopes.inscope("x").unwrap(), first);
}

#[test]
fn mutable_variables_cannot_be_shadowed() {
    let mut scopes = Scopes::new();
    scopes.scope_with("m", Mutability::Mutable).unwrap();
    assert_eq!(
        scopes.scope("m"),
        Err(ScopeError::ShadowMutable {
            name: "m".to_string()
        })
    );
}

#[test]
fn hidden_variables_do_not_resolve() {
    let mut scopes = Scopes::new();
    let x = scopes.scope("x").unwrap();
    scopes.set_hidden(x, true);
    assert_eq!(
        scopes.inscope("x"),
        Err(ScopeError::Hidden {
            name: "x".to_string()
        })
    );
    scopes.set_hidden(x, false);
    assert_eq!(scopes.inscope("x").unwrap(), x);
}

#[test]
fn global_redefinition_replaces_outright() {
    let mut scopes = Scopes::new();
    let first = scopes
        .scope_root_global("g", Mutability::Final)
        .unwrap();
    let second = scopes
        .scope_root_global("g", Mutability::Final)
        .unwrap();
    assert_ne!(first, second);
    // The old binding is gone, not shadowed: removing the new one leaves
    // nothing behind.
    assert_eq!(scopes.inscope("g").unwrap(), second);
    scopes.unscope(second).unwrap();
    assert!(scopes.inscope("g").is_err());
}

#[test]
fn globals_reject_tags() {
    let mut scopes = Scopes::new();
    assert_eq!(
        scopes.scope_root_global("g#1", Mutability::Final),
        Err(ScopeError::InvalidName {
            reference: "g#1".to_string()
        })
    );
}

#[test]
fn local_definition_shadows_import() {
    let mut scopes = Scopes::new();
    let ns = scopes.create_namespace("m");
    let exported = scopes.scope_global(ns, "f", Mutability::Final).unwrap();
    let root = scopes.root_namespace();
    scopes.import(root, ns).unwrap();
    assert_eq!(scopes.inscope("f").unwrap(), exported);

    let local = scopes.scope("f").unwrap();
    assert_eq!(scopes.inscope("f").unwrap(), local);
    // An explicit local-only lookup never falls back to imports.
    scopes.unscope(local).unwrap();
    assert!(scopes.inscope_local("f").is_err());
}

#[test]
fn underscore_names_are_not_exported_by_default() {
    let mut scopes = Scopes::new();
    let ns = scopes.create_namespace("m");
    scopes.scope_global(ns, "f", Mutability::Final).unwrap();
    scopes.scope_global(ns, "_private", Mutability::Final).unwrap();
    let root = scopes.root_namespace();
    scopes.import(root, ns).unwrap();

    assert!(scopes.inscope("f").is_ok());
    assert!(scopes.inscope("_private").is_err());
}

#[test]
fn imports_are_a_snapshot() {
    let mut scopes = Scopes::new();
    let ns = scopes.create_namespace("m");
    let old = scopes.scope_global(ns, "f", Mutability::Final).unwrap();
    let root = scopes.root_namespace();
    scopes.import(root, ns).unwrap();

    let new = scopes.scope_global(ns, "f", Mutability::Final).unwrap();
    assert_ne!(old, new);
    assert_eq!(scopes.inscope("f").unwrap(), old);
}

#[test]
fn exports_must_name_defined_variables() {
    let mut scopes = Scopes::new();
    let ns = scopes.create_namespace("m");
    let err = scopes
        .set_exports(ns, ["missing".to_string()])
        .unwrap_err();
    assert!(matches!(err, ScopeError::NotExported { .. }));
}

#[test]
fn finalized_namespace_rejects_mutation() {
    let mut scopes = Scopes::new();
    let ns = scopes.create_namespace("m");
    scopes.make_final(ns);
    scopes.make_final(ns); // idempotent
    let err = scopes
        .scope_global(ns, "late", Mutability::Final)
        .unwrap_err();
    // A finalized-namespace write is a driver bug, not a user error.
    assert!(matches!(err, ScopeError::Internal(_)));
}
