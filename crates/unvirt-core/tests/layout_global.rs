use std::sync::Arc;
use unvirt_core::{FieldKind, IrError, StateField, StateLayout};

fn arm_like() -> StateLayout {
    let mut fields: Vec<StateField> = (0..4)
        .map(|i| StateField::new(format!("x{}", i), i * 8, 8, FieldKind::Register))
        .collect();
    fields.push(StateField::new("pc", 32, 8, FieldKind::ProgramCounter));
    StateLayout::new("arm-like", 40, fields).unwrap()
}

// The global layout is write-once, so every assertion about it lives in one test.
#[test]
fn test_global_layout_is_installed_once() {
    assert!(StateLayout::global().is_none());

    let installed = StateLayout::install_global(arm_like()).unwrap();
    assert_eq!(installed.field_named("pc").map(|f| f.offset), Some(32));
    assert_eq!(installed.describe(12, 4), "x1+4");

    assert!(matches!(
        StateLayout::install_global(StateLayout::x86_64()),
        Err(IrError::LayoutAlreadyInstalled)
    ));

    let global = StateLayout::global().unwrap();
    assert!(Arc::ptr_eq(&global, &installed));
    assert!(Arc::ptr_eq(&StateLayout::global_or_default(), &installed));
}

#[test]
fn test_overlapping_fields_are_rejected() {
    let fields = vec![
        StateField::new("a", 0, 8, FieldKind::Register),
        StateField::new("b", 4, 8, FieldKind::Register),
    ];
    assert!(matches!(
        StateLayout::new("bad", 16, fields),
        Err(IrError::InvalidLayout(_))
    ));
}
