use std::slice::{
    Iter,
    IterMut,
};

use rustc_hash::FxHashMap;

use crate::ir::error::IrError;

/// Stable identifier of an element inside an [`IdMap`]. `0` means "not yet inserted".
pub type Id = usize;

pub(crate) trait HasIdMut {
    fn id_mut(&mut self) -> &mut Id;
}

/// Everything that lives in an [`IdMap`] has an ID
pub trait HasId {
    /// The ID of this element
    fn id(&self) -> Id;
}

#[derive(Debug, Clone)]
pub(crate) struct IdFactory {
    cursor: Id,
}

impl IdFactory {
    pub(crate) fn new() -> Self {
        Self {
            cursor: Id::default().wrapping_add(1),
        }
    }

    pub(crate) fn next(&mut self) -> Id {
        let ret = self.cursor;
        self.cursor = ret.checked_add(1).expect("Ran out of possible ID values");
        ret
    }

    fn observe(&mut self, id: Id) {
        if id >= self.cursor {
            self.cursor = id + 1;
        }
    }
}

pub(crate) type IdMapValues<'a, T> = Iter<'a, T>;
pub(crate) type IdMapValuesMut<'a, T> = IterMut<'a, T>;

/// An ordered container whose elements keep their ID no matter where they move.
/// The order of the elements is meaningful (layout order of blocks, list order of globals).
#[derive(Clone, Debug)]
pub(crate) struct IdMap<T>
where
    T: HasId + HasIdMut,
{
    data: Vec<T>,
    factory: IdFactory,
}

impl<T> IdMap<T>
where
    T: HasId + HasIdMut,
{
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::new(),
            factory: IdFactory::new(),
        }
    }

    fn reserve_id(&mut self, elem: &mut T) -> Id {
        let mut id = elem.id();

        if id == Id::default() {
            id = self.factory.next();
            *elem.id_mut() = id;
        } else {
            self.factory.observe(id);
        }

        id
    }

    pub(crate) fn insert(&mut self, mut elem: T) -> Id {
        let id = self.reserve_id(&mut elem);
        self.data.push(elem);
        id
    }

    pub(crate) fn insert_at(&mut self, idx: usize, mut elem: T) -> Id {
        let id = self.reserve_id(&mut elem);
        self.data.insert(idx, elem);
        id
    }

    pub(crate) fn get(&self, id: Id) -> Option<&T> {
        self.data.iter().find(|&elem| elem.id() == id)
    }

    pub(crate) fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.data.iter_mut().find(|elem| elem.id() == id)
    }

    pub(crate) fn position(&self, id: Id) -> Option<usize> {
        self.data.iter().position(|elem| elem.id() == id)
    }

    pub(crate) fn remove(&mut self, id: Id) -> Option<T> {
        let idx = self.position(id)?;
        Some(self.data.remove(idx))
    }

    pub(crate) fn values(&self) -> IdMapValues<T> {
        self.data.iter()
    }

    pub(crate) fn values_mut(&mut self) -> IdMapValuesMut<T> {
        self.data.iter_mut()
    }

    pub(crate) fn get_at(&self, idx: usize) -> Option<&T> {
        self.data.get(idx)
    }

    pub(crate) fn get_at_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.data.get_mut(idx)
    }

    /// Reorder the elements. `order` must be a permutation of the current IDs,
    /// otherwise nothing is moved and an error is returned.
    pub(crate) fn reorder(&mut self, order: &[Id]) -> Result<(), IrError> {
        if order.len() != self.data.len() {
            return Err(IrError::InvalidOrder(order.len(), self.data.len()));
        }

        let mut positions: FxHashMap<Id, usize> = self.data.iter().enumerate().map(|(idx, elem)| (elem.id(), idx)).collect();
        let mut indices = Vec::with_capacity(order.len());

        for id in order {
            /* Removing the entry also rejects duplicates */
            let idx = positions.remove(id).ok_or(IrError::UnknownId(*id))?;
            indices.push(idx);
        }

        let mut old: Vec<Option<T>> = std::mem::take(&mut self.data).into_iter().map(Some).collect();
        self.data = indices.into_iter().filter_map(|idx| old[idx].take()).collect();
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Generates the ID-based accessors of a container type for one of its `IdMap` fields.
macro_rules! idmap_functions {
    ($parent:ty, $field:ident, $child:ty, $suffix:ident) => {
        impl $parent {
            paste! {
                pub fn $suffix(&self, id: Id) -> Option<&$child> {
                    self.$field.get(id)
                }

                pub fn [<$suffix _mut>](&mut self, id: Id) -> Option<&mut $child> {
                    self.$field.get_mut(id)
                }

                pub fn [<num_ $suffix s>](&self) -> usize {
                    self.$field.len()
                }

                pub fn [<$suffix _at>](&self, idx: usize) -> Option<&$child> {
                    self.$field.get_at(idx)
                }

                pub fn [<$suffix _at_mut>](&mut self, idx: usize) -> Option<&mut $child> {
                    self.$field.get_at_mut(idx)
                }

                pub fn [<position_of_ $suffix>](&self, id: Id) -> Option<usize> {
                    self.$field.position(id)
                }

                pub fn [<iter_ $suffix s>](&self) -> IdMapValues<$child> {
                    self.$field.values()
                }

                pub fn [<iter_ $suffix s_mut>](&mut self) -> IdMapValuesMut<$child> {
                    self.$field.values_mut()
                }
            }
        }
    };
}
pub(crate) use idmap_functions;
