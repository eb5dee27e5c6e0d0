//! Mapping classes: `dict` (insertion-ordered) and `set`.

use crate::builtins::{expect_arity, expect_arity_range, values_equal};
use crate::runtime::context::Context;
use crate::runtime::exception::{Exec, Raised};
use crate::runtime::object::{ObjId, Payload};

pub(crate) fn register(ctx: &mut Context) {
    let dict_class = ctx.new_class("dict", &[]).expect("dict class allocation");
    ctx.builtins.dict_class = dict_class;
    ctx.set_class_ctor(dict_class, dict_ctor);
    ctx.bind_method(dict_class, "__len__", crate::builtins::sequence::seq_len);
    ctx.bind_method(dict_class, "__getitem__", dict_getitem);
    ctx.bind_method(dict_class, "__setitem__", dict_setitem);
    ctx.bind_method(dict_class, "__contains__", dict_contains);
    ctx.bind_method(dict_class, "__eq__", dict_eq);
    ctx.bind_method(dict_class, "__ne__", dict_ne);
    ctx.bind_method(dict_class, "get", dict_get);
    ctx.bind_method(dict_class, "keys", dict_keys);
    ctx.bind_method(dict_class, "values", dict_values);
    ctx.bind_method(dict_class, "items", dict_items_method);
    ctx.bind_method(dict_class, "pop", dict_pop);
    ctx.bind_method(dict_class, "update", dict_update);

    let set_class = ctx.new_class("set", &[]).expect("set class allocation");
    ctx.builtins.set_class = set_class;
    ctx.set_class_ctor(set_class, set_ctor);
    ctx.bind_method(set_class, "__len__", crate::builtins::sequence::seq_len);
    ctx.bind_method(set_class, "__contains__", set_contains);
    ctx.bind_method(set_class, "__eq__", set_eq);
    ctx.bind_method(set_class, "add", set_add);
    ctx.bind_method(set_class, "remove", set_remove);
    ctx.bind_method(set_class, "discard", set_discard);
}

fn dict_of(ctx: &mut Context, args: &[ObjId], position: usize) -> Exec<ObjId> {
    if !ctx.is_dictionary(args[position]) {
        ctx.raise_argument_type_error(position, "dict");
        return Err(Raised);
    }
    Ok(args[position])
}

fn dict_pairs(ctx: &Context, dict: ObjId) -> Vec<(ObjId, ObjId)> {
    match &ctx.obj(dict).payload {
        Payload::Dict(entries) => entries.values().copied().collect(),
        _ => Vec::new(),
    }
}

fn dict_ctor(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity_range(ctx, args, 0, 1)?;
    let mut pairs = Vec::new();
    if !args.is_empty() {
        let source = dict_of(ctx, args, 0)?;
        pairs.extend(dict_pairs(ctx, source));
    }
    let kwargs = ctx.kwargs()?;
    pairs.extend(dict_pairs(ctx, kwargs));
    ctx.new_dict(&pairs)
}

fn dict_getitem(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let dict = dict_of(ctx, args, 0)?;
    let hash = ctx.hash_key(args[1])?;
    let found = match &ctx.obj(dict).payload {
        Payload::Dict(entries) => entries.get(&hash).map(|(_, value)| *value),
        _ => None,
    };
    match found {
        Some(value) => Ok(value),
        None => {
            ctx.raise_key_error(Some(args[1]));
            Err(Raised)
        }
    }
}

fn dict_setitem(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 3)?;
    let dict = dict_of(ctx, args, 0)?;
    let len = dict_pairs(ctx, dict).len();
    ctx.check_collection_size(len + 1)?;
    ctx.dict_insert(dict, args[1], args[2])?;
    Ok(ctx.new_none())
}

fn dict_contains(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let dict = dict_of(ctx, args, 0)?;
    let hash = ctx.hash_key(args[1])?;
    let found = match &ctx.obj(dict).payload {
        Payload::Dict(entries) => entries.contains_key(&hash),
        _ => false,
    };
    Ok(ctx.new_bool(found))
}

fn dict_eq(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let equal = dicts_equal(ctx, args[0], args[1])?;
    Ok(ctx.new_bool(equal))
}

fn dict_ne(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let equal = dicts_equal(ctx, args[0], args[1])?;
    Ok(ctx.new_bool(!equal))
}

fn dicts_equal(ctx: &mut Context, left: ObjId, right: ObjId) -> Exec<bool> {
    let (left_entries, right_entries) =
        match (&ctx.obj(left).payload, &ctx.obj(right).payload) {
            (Payload::Dict(a), Payload::Dict(b)) => (a.clone(), b.clone()),
            _ => return Ok(false),
        };
    if left_entries.len() != right_entries.len() {
        return Ok(false);
    }
    for (hash, (_, left_value)) in &left_entries {
        let Some((_, right_value)) = right_entries.get(hash) else {
            return Ok(false);
        };
        if !values_equal(ctx, *left_value, *right_value)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn dict_get(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity_range(ctx, args, 2, 3)?;
    let dict = dict_of(ctx, args, 0)?;
    let hash = ctx.hash_key(args[1])?;
    let found = match &ctx.obj(dict).payload {
        Payload::Dict(entries) => entries.get(&hash).map(|(_, value)| *value),
        _ => None,
    };
    Ok(found
        .or(args.get(2).copied())
        .unwrap_or_else(|| ctx.new_none()))
}

fn dict_keys(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    let dict = dict_of(ctx, args, 0)?;
    let keys: Vec<ObjId> = dict_pairs(ctx, dict).into_iter().map(|(key, _)| key).collect();
    ctx.new_list(&keys)
}

fn dict_values(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    let dict = dict_of(ctx, args, 0)?;
    let values: Vec<ObjId> = dict_pairs(ctx, dict)
        .into_iter()
        .map(|(_, value)| value)
        .collect();
    ctx.new_list(&values)
}

fn dict_items_method(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    let dict = dict_of(ctx, args, 0)?;
    let pairs = dict_pairs(ctx, dict);
    let mut items = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        items.push(ctx.new_tuple(&[key, value])?);
    }
    ctx.new_list(&items)
}

fn dict_pop(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity_range(ctx, args, 2, 3)?;
    let dict = dict_of(ctx, args, 0)?;
    let hash = ctx.hash_key(args[1])?;
    let removed = match &mut ctx.obj_mut(dict).payload {
        Payload::Dict(entries) => entries.shift_remove(&hash).map(|(_, value)| value),
        _ => None,
    };
    match removed.or(args.get(2).copied()) {
        Some(value) => Ok(value),
        None => {
            ctx.raise_key_error(Some(args[1]));
            Err(Raised)
        }
    }
}

fn dict_update(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let dict = dict_of(ctx, args, 0)?;
    let other = dict_of(ctx, args, 1)?;
    for (key, value) in dict_pairs(ctx, other) {
        ctx.dict_insert(dict, key, value)?;
    }
    Ok(ctx.new_none())
}

// ----- set -----

fn set_ctor(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity_range(ctx, args, 0, 1)?;
    let items = match args.first() {
        Some(&source) => ctx.iterate_collect(source)?,
        None => Vec::new(),
    };
    ctx.new_set(&items)
}

fn set_of(ctx: &mut Context, args: &[ObjId], position: usize) -> Exec<ObjId> {
    if !ctx.is_set(args[position]) {
        ctx.raise_argument_type_error(position, "set");
        return Err(Raised);
    }
    Ok(args[position])
}

fn set_contains(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let set = set_of(ctx, args, 0)?;
    let hash = ctx.hash_key(args[1])?;
    let found = match &ctx.obj(set).payload {
        Payload::Set(entries) => entries.contains_key(&hash),
        _ => false,
    };
    Ok(ctx.new_bool(found))
}

fn set_eq(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let equal = match (&ctx.obj(args[0]).payload, &ctx.obj(args[1]).payload) {
        (Payload::Set(a), Payload::Set(b)) => {
            a.len() == b.len() && a.keys().all(|key| b.contains_key(key))
        }
        _ => false,
    };
    Ok(ctx.new_bool(equal))
}

fn set_add(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let set = set_of(ctx, args, 0)?;
    let len = match &ctx.obj(set).payload {
        Payload::Set(entries) => entries.len(),
        _ => 0,
    };
    ctx.check_collection_size(len + 1)?;
    let hash = ctx.hash_key(args[1])?;
    if let Payload::Set(entries) = &mut ctx.obj_mut(set).payload {
        entries.insert(hash, args[1]);
    }
    Ok(ctx.new_none())
}

fn set_remove(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let set = set_of(ctx, args, 0)?;
    let hash = ctx.hash_key(args[1])?;
    let removed = match &mut ctx.obj_mut(set).payload {
        Payload::Set(entries) => entries.shift_remove(&hash).is_some(),
        _ => false,
    };
    if !removed {
        ctx.raise_key_error(Some(args[1]));
        return Err(Raised);
    }
    Ok(ctx.new_none())
}

fn set_discard(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let set = set_of(ctx, args, 0)?;
    let hash = ctx.hash_key(args[1])?;
    if let Payload::Set(entries) = &mut ctx.obj_mut(set).payload {
        entries.shift_remove(&hash);
    }
    Ok(ctx.new_none())
}
