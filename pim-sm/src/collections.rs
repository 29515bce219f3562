//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use generational_arena::Index;
use pim_utils::mfea::{MAX_VIFS, VifIndex};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::interface::Interface;
use crate::neighbor::Neighbor;

pub type ObjectId = u32;

// An object is addressable either by its ephemeral ID (used in timer
// messages) or by its natural key.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum ObjectKey<T> {
    Id(ObjectId),
    Value(T),
}

pub type InterfaceId = ObjectId;
pub type InterfaceIndex = Index;
pub type InterfaceKey = ObjectKey<String>;
pub type NeighborId = ObjectId;
pub type NeighborIndex = Index;
pub type NeighborKey = ObjectKey<IpAddr>;

// A generation-checked object arena.
//
// Handles held in back-reference lists may outlive the object they name;
// dereferencing a stale handle yields None rather than another object.
#[derive(Debug)]
pub struct Arena<T>(generational_arena::Arena<T>);

#[derive(Debug, Default)]
pub struct Interfaces {
    id_tree: HashMap<InterfaceId, InterfaceIndex>,
    name_tree: BTreeMap<String, InterfaceIndex>,
    ifindex_tree: HashMap<u32, InterfaceIndex>,
    vif_tree: BTreeMap<VifIndex, InterfaceIndex>,
    next_id: InterfaceId,
}

#[derive(Debug, Default)]
pub struct Neighbors {
    id_tree: HashMap<NeighborId, NeighborIndex>,
    addr_tree: BTreeMap<IpAddr, NeighborIndex>,
    next_id: NeighborId,
}

// ===== impl ObjectKey =====

impl<T> From<ObjectId> for ObjectKey<T> {
    fn from(id: ObjectId) -> ObjectKey<T> {
        ObjectKey::Id(id)
    }
}

// ===== impl Arena =====

impl<T> Arena<T> {
    pub(crate) fn insert(&mut self, value: T) -> Index {
        self.0.insert(value)
    }

    pub(crate) fn remove(&mut self, index: Index) -> Option<T> {
        self.0.remove(index)
    }

    pub fn get(&self, index: Index) -> Option<&T> {
        self.0.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: Index) -> Option<&mut T> {
        self.0.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Index, &T)> {
        self.0.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (Index, &mut T)> {
        self.0.iter_mut()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Arena<T> {
        Arena(Default::default())
    }
}

impl<T> std::ops::Index<Index> for Arena<T> {
    type Output = T;

    fn index(&self, index: Index) -> &Self::Output {
        &self.0[index]
    }
}

impl<T> std::ops::IndexMut<Index> for Arena<T> {
    fn index_mut(&mut self, index: Index) -> &mut Self::Output {
        &mut self.0[index]
    }
}

// ===== impl Interfaces =====

impl Interfaces {
    pub(crate) fn insert<'a>(
        &mut self,
        arena: &'a mut Arena<Interface>,
        ifname: &str,
    ) -> Result<(InterfaceIndex, &'a mut Interface), Error> {
        if self.name_tree.contains_key(ifname) {
            return Err(Error::InterfaceExists(ifname.to_owned()));
        }

        // Allocate the lowest free vif index.
        let vif_index = (0..MAX_VIFS as VifIndex)
            .find(|vif_index| !self.vif_tree.contains_key(vif_index))
            .ok_or_else(|| Error::VifLimitReached(ifname.to_owned()))?;

        self.next_id += 1;
        let iface =
            Interface::new(self.next_id, ifname.to_owned(), vif_index);
        let iface_idx = arena.insert(iface);

        let iface = &mut arena[iface_idx];
        self.id_tree.insert(iface.id, iface_idx);
        self.name_tree.insert(iface.name.clone(), iface_idx);
        self.vif_tree.insert(vif_index, iface_idx);

        Ok((iface_idx, iface))
    }

    pub(crate) fn delete(
        &mut self,
        arena: &mut Arena<Interface>,
        iface_idx: InterfaceIndex,
    ) {
        let iface = &mut arena[iface_idx];

        self.id_tree.remove(&iface.id);
        self.name_tree.remove(&iface.name);
        self.vif_tree.remove(&iface.vif_index);
        if let Some(ifindex) = iface.system.ifindex {
            self.ifindex_tree.remove(&ifindex);
        }

        arena.remove(iface_idx);
    }

    pub(crate) fn update_ifindex(
        &mut self,
        iface_idx: InterfaceIndex,
        iface: &mut Interface,
        ifindex: Option<u32>,
    ) {
        if let Some(old_ifindex) = iface.system.ifindex.take() {
            self.ifindex_tree.remove(&old_ifindex);
        }
        iface.system.ifindex = ifindex;
        if let Some(ifindex) = ifindex {
            self.ifindex_tree.insert(ifindex, iface_idx);
        }
    }

    // Returns a reference to the interface corresponding to the given ID.
    pub(crate) fn get_by_id<'a>(
        &self,
        arena: &'a Arena<Interface>,
        id: InterfaceId,
    ) -> Result<(InterfaceIndex, &'a Interface), Error> {
        self.id_tree
            .get(&id)
            .copied()
            .map(|iface_idx| (iface_idx, &arena[iface_idx]))
            .filter(|(_, iface)| iface.id == id)
            .ok_or(Error::InterfaceIdNotFound(id))
    }

    pub(crate) fn get_mut_by_id<'a>(
        &mut self,
        arena: &'a mut Arena<Interface>,
        id: InterfaceId,
    ) -> Result<(InterfaceIndex, &'a mut Interface), Error> {
        self.id_tree
            .get(&id)
            .copied()
            .map(move |iface_idx| (iface_idx, &mut arena[iface_idx]))
            .filter(|(_, iface)| iface.id == id)
            .ok_or(Error::InterfaceIdNotFound(id))
    }

    pub fn get_by_name<'a>(
        &self,
        arena: &'a Arena<Interface>,
        ifname: &str,
    ) -> Option<(InterfaceIndex, &'a Interface)> {
        self.name_tree
            .get(ifname)
            .copied()
            .map(|iface_idx| (iface_idx, &arena[iface_idx]))
    }

    pub(crate) fn get_mut_by_name<'a>(
        &mut self,
        arena: &'a mut Arena<Interface>,
        ifname: &str,
    ) -> Option<(InterfaceIndex, &'a mut Interface)> {
        self.name_tree
            .get(ifname)
            .copied()
            .map(move |iface_idx| (iface_idx, &mut arena[iface_idx]))
    }

    pub fn get_by_ifindex<'a>(
        &self,
        arena: &'a Arena<Interface>,
        ifindex: u32,
    ) -> Option<(InterfaceIndex, &'a Interface)> {
        self.ifindex_tree
            .get(&ifindex)
            .copied()
            .map(|iface_idx| (iface_idx, &arena[iface_idx]))
    }

    pub fn get_by_vif_index<'a>(
        &self,
        arena: &'a Arena<Interface>,
        vif_index: VifIndex,
    ) -> Option<(InterfaceIndex, &'a Interface)> {
        self.vif_tree
            .get(&vif_index)
            .copied()
            .map(|iface_idx| (iface_idx, &arena[iface_idx]))
    }

    pub(crate) fn get_mut_by_vif_index<'a>(
        &mut self,
        arena: &'a mut Arena<Interface>,
        vif_index: VifIndex,
    ) -> Option<(InterfaceIndex, &'a mut Interface)> {
        self.vif_tree
            .get(&vif_index)
            .copied()
            .map(move |iface_idx| (iface_idx, &mut arena[iface_idx]))
    }

    // Resolves an interface key from a timer or event message.
    pub(crate) fn get_by_key<'a>(
        &self,
        arena: &'a Arena<Interface>,
        key: &InterfaceKey,
    ) -> Result<(InterfaceIndex, &'a Interface), Error> {
        match key {
            InterfaceKey::Id(id) => self.get_by_id(arena, *id),
            InterfaceKey::Value(ifname) => self
                .get_by_name(arena, ifname)
                .ok_or_else(|| Error::InterfaceNotFound(ifname.clone())),
        }
    }

    pub(crate) fn get_mut_by_key<'a>(
        &mut self,
        arena: &'a mut Arena<Interface>,
        key: &InterfaceKey,
    ) -> Result<(InterfaceIndex, &'a mut Interface), Error> {
        match key {
            InterfaceKey::Id(id) => self.get_mut_by_id(arena, *id),
            InterfaceKey::Value(ifname) => self
                .get_mut_by_name(arena, ifname)
                .ok_or_else(|| Error::InterfaceNotFound(ifname.clone())),
        }
    }

    pub(crate) fn indexes(
        &self,
    ) -> impl Iterator<Item = InterfaceIndex> + '_ {
        self.name_tree.values().copied()
    }

    pub(crate) fn iter<'a>(
        &'a self,
        arena: &'a Arena<Interface>,
    ) -> impl Iterator<Item = &'a Interface> + 'a {
        self.name_tree.values().map(|iface_idx| &arena[*iface_idx])
    }
}

// ===== impl Neighbors =====

impl Neighbors {
    pub(crate) fn insert<'a>(
        &mut self,
        arena: &'a mut Arena<Neighbor>,
        vif_index: VifIndex,
        addr: IpAddr,
    ) -> (NeighborIndex, &'a mut Neighbor) {
        self.next_id += 1;
        let nbr = Neighbor::new(self.next_id, vif_index, addr);
        let nbr_idx = arena.insert(nbr);

        let nbr = &mut arena[nbr_idx];
        self.id_tree.insert(nbr.id, nbr_idx);
        self.addr_tree.insert(nbr.addr, nbr_idx);

        (nbr_idx, nbr)
    }

    pub(crate) fn delete(
        &mut self,
        arena: &mut Arena<Neighbor>,
        nbr_idx: NeighborIndex,
    ) {
        let nbr = &mut arena[nbr_idx];

        self.id_tree.remove(&nbr.id);
        self.addr_tree.remove(&nbr.addr);

        arena.remove(nbr_idx);
    }

    // Removes the neighbor from the lookup trees but keeps the object
    // alive in the arena; final destruction is deferred until every
    // dependent routing entry has been re-parented.
    pub(crate) fn detach(
        &mut self,
        arena: &Arena<Neighbor>,
        nbr_idx: NeighborIndex,
    ) {
        if let Some(nbr) = arena.get(nbr_idx) {
            self.id_tree.remove(&nbr.id);
            self.addr_tree.remove(&nbr.addr);
        }
    }

    pub(crate) fn get_by_id<'a>(
        &self,
        arena: &'a Arena<Neighbor>,
        id: NeighborId,
    ) -> Result<(NeighborIndex, &'a Neighbor), Error> {
        self.id_tree
            .get(&id)
            .copied()
            .map(|nbr_idx| (nbr_idx, &arena[nbr_idx]))
            .filter(|(_, nbr)| nbr.id == id)
            .ok_or(Error::NeighborIdNotFound(id))
    }

    pub fn get_by_addr<'a>(
        &self,
        arena: &'a Arena<Neighbor>,
        addr: &IpAddr,
    ) -> Option<(NeighborIndex, &'a Neighbor)> {
        self.addr_tree
            .get(addr)
            .copied()
            .map(|nbr_idx| (nbr_idx, &arena[nbr_idx]))
    }

    pub(crate) fn get_mut_by_addr<'a>(
        &mut self,
        arena: &'a mut Arena<Neighbor>,
        addr: &IpAddr,
    ) -> Option<(NeighborIndex, &'a mut Neighbor)> {
        self.addr_tree
            .get(addr)
            .copied()
            .map(move |nbr_idx| (nbr_idx, &mut arena[nbr_idx]))
    }

    // Looks a neighbor up by primary or secondary address.
    pub fn get_by_any_addr<'a>(
        &self,
        arena: &'a Arena<Neighbor>,
        addr: &IpAddr,
    ) -> Option<(NeighborIndex, &'a Neighbor)> {
        self.get_by_addr(arena, addr).or_else(|| {
            self.addr_tree
                .values()
                .copied()
                .map(|nbr_idx| (nbr_idx, &arena[nbr_idx]))
                .find(|(_, nbr)| nbr.secondary_addrs.contains(addr))
        })
    }

    pub(crate) fn get_by_key<'a>(
        &self,
        arena: &'a Arena<Neighbor>,
        key: &NeighborKey,
    ) -> Result<(NeighborIndex, &'a Neighbor), Error> {
        match key {
            NeighborKey::Id(id) => self.get_by_id(arena, *id),
            NeighborKey::Value(addr) => {
                self.get_by_addr(arena, addr).ok_or_else(|| {
                    Error::UnknownNeighbor(String::new(), *addr)
                })
            }
        }
    }

    pub(crate) fn indexes(&self) -> impl Iterator<Item = NeighborIndex> + '_ {
        self.addr_tree.values().copied()
    }

    pub(crate) fn iter<'a>(
        &'a self,
        arena: &'a Arena<Neighbor>,
    ) -> impl Iterator<Item = &'a Neighbor> + 'a {
        self.addr_tree.values().map(|nbr_idx| &arena[*nbr_idx])
    }

    pub fn is_empty(&self) -> bool {
        self.addr_tree.is_empty()
    }
}
