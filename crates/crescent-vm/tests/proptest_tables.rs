//! Table engine properties exercised through the host API: the sequence
//! border under appends and trims, key normalization, and traversal that
//! covers every live pair exactly once.

use std::collections::HashSet;

use crescent_vm::{Lua, LuaValue};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sequential_appends_extend_the_border(n in 1usize..48) {
        let lua = Lua::new();
        lua.with_state(|st| -> Result<(), TestCaseError> {
            st.new_table(0, 0).unwrap();
            for i in 1..=n {
                st.push_integer(i as i64).unwrap();
                st.push_integer((i * i) as i64).unwrap();
                st.raw_set(1).unwrap();
                prop_assert_eq!(st.raw_len(1), i);
            }
            Ok(())
        })?;
    }

    #[test]
    fn erasing_the_last_element_shrinks_the_border(n in 2usize..40) {
        let lua = Lua::new();
        lua.with_state(|st| -> Result<(), TestCaseError> {
            st.new_table(n, 0).unwrap();
            for i in 1..=n {
                st.push_integer(i as i64).unwrap();
                st.push_integer(i as i64).unwrap();
                st.raw_set(1).unwrap();
            }
            st.push_integer(n as i64).unwrap();
            st.push_nil().unwrap();
            st.raw_set(1).unwrap();
            prop_assert_eq!(st.raw_len(1), n - 1);
            Ok(())
        })?;
    }

    #[test]
    fn integral_float_keys_land_on_the_integer_slot(n in 1i64..64) {
        let lua = Lua::new();
        lua.with_state(|st| -> Result<(), TestCaseError> {
            st.new_table(0, 0).unwrap();
            st.push_value(LuaValue::Float(n as f64)).unwrap();
            st.push_str("via-float").unwrap();
            st.raw_set(1).unwrap();
            st.push_integer(n).unwrap();
            st.raw_get(1).unwrap();
            let got = st.to_str(-1);
            prop_assert_eq!(got.as_deref(), Some("via-float"));
            st.pop(1);
            Ok(())
        })?;
    }

    #[test]
    fn traversal_visits_every_pair_once(
        keys in prop::collection::hash_set("[a-z]{1,6}", 1..16),
        arr in 0usize..8,
    ) {
        let lua = Lua::new();
        lua.with_state(|st| -> Result<(), TestCaseError> {
            st.new_table(arr, keys.len()).unwrap();
            for i in 1..=arr {
                st.push_integer(i as i64).unwrap();
                st.push_integer(100 + i as i64).unwrap();
                st.raw_set(1).unwrap();
            }
            for k in &keys {
                st.push_str(k).unwrap();
                st.push_integer(k.len() as i64).unwrap();
                st.raw_set(1).unwrap();
            }

            let mut seen_ints = HashSet::new();
            let mut seen_strs = HashSet::new();
            st.push_nil().unwrap();
            while st.next_entry(1).unwrap() {
                match st.value(-2) {
                    LuaValue::Integer(i) => prop_assert!(seen_ints.insert(i)),
                    LuaValue::Str(s) => prop_assert!(seen_strs.insert(s.to_string())),
                    other => prop_assert!(false, "unexpected key {:?}", other),
                }
                // drop the value, keep the key for the next step
                st.pop(1);
            }
            prop_assert_eq!(seen_ints.len(), arr);
            prop_assert_eq!(&seen_strs, &keys);
            Ok(())
        })?;
    }
}
