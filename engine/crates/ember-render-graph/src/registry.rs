//! graph 中三类对象的注册表
//!
//! 使用 SlotMap 存储，对外只暴露带代际信息的 id；`order` 记录注册顺序，
//! 执行与创建按注册顺序进行，销毁按注册顺序的逆序进行。

use slotmap::SlotMap;

use crate::graph_object::{GraphObject, Lifecycle};
use crate::pass::CommandPass;
use crate::resource_handle::ResourceHandle;
use crate::state_dep::StateDep;

slotmap::new_key_type! { pub struct ResourceId; }
slotmap::new_key_type! { pub struct ObjectId; }
slotmap::new_key_type! { pub struct PassId; }

/// 用于编辑器等外部观察者的只读信息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo<Id> {
    pub id: Id,
    pub name: String,
    pub dependencies: StateDep,
    pub lifecycle: Lifecycle,
}

// ---------------- resources ----------------

#[derive(Default)]
pub struct Resources {
    handles: SlotMap<ResourceId, ResourceHandle>,
    order: Vec<ResourceId>,
}

impl Resources {
    pub(crate) fn insert(&mut self, handle: ResourceHandle) -> ResourceId {
        let id = self.handles.insert(handle);
        self.order.push(id);
        id
    }

    pub(crate) fn remove(&mut self, id: ResourceId) -> Option<ResourceHandle> {
        self.order.retain(|i| *i != id);
        self.handles.remove(id)
    }

    #[inline]
    pub fn get(&self, id: ResourceId) -> Option<&ResourceHandle> {
        self.handles.get(id)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: ResourceId) -> Option<&mut ResourceHandle> {
        self.handles.get_mut(id)
    }

    /// 按注册顺序
    #[inline]
    pub fn ids(&self) -> &[ResourceId] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceId, &ResourceHandle)> {
        self.order.iter().map(|id| (*id, &self.handles[*id]))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ---------------- objects ----------------

pub(crate) struct ObjectEntry {
    pub(crate) object: Box<dyn GraphObject>,
    pub(crate) lifecycle: Lifecycle,
}

#[derive(Default)]
pub struct Objects {
    entries: SlotMap<ObjectId, ObjectEntry>,
    order: Vec<ObjectId>,
}

impl Objects {
    pub(crate) fn insert(&mut self, object: Box<dyn GraphObject>) -> ObjectId {
        let id = self.entries.insert(ObjectEntry {
            object,
            lifecycle: Lifecycle::Uninitialized,
        });
        self.order.push(id);
        id
    }

    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<Box<dyn GraphObject>> {
        self.order.retain(|i| *i != id);
        self.entries.remove(id).map(|e| e.object)
    }

    #[inline]
    pub(crate) fn entry_mut(&mut self, id: ObjectId) -> Option<&mut ObjectEntry> {
        self.entries.get_mut(id)
    }

    /// 类型不匹配或者对象未创建时返回 None
    pub fn get<T: GraphObject>(&self, id: ObjectId) -> Option<&T> {
        let entry = self.entries.get(id)?;
        if !entry.lifecycle.is_created() {
            return None;
        }
        entry.object.as_ref().as_any().downcast_ref::<T>()
    }

    pub fn lifecycle(&self, id: ObjectId) -> Option<Lifecycle> {
        self.entries.get(id).map(|e| e.lifecycle)
    }

    /// 总是包含 `DEVICE`
    pub fn dependencies(&self, id: ObjectId) -> Option<StateDep> {
        self.entries.get(id).map(|e| e.object.dependencies() | StateDep::DEVICE)
    }

    #[inline]
    pub fn ids(&self) -> &[ObjectId] {
        &self.order
    }

    pub fn infos(&self) -> Vec<EntryInfo<ObjectId>> {
        self.order
            .iter()
            .map(|id| {
                let entry = &self.entries[*id];
                EntryInfo {
                    id: *id,
                    name: entry.object.name().to_string(),
                    dependencies: entry.object.dependencies() | StateDep::DEVICE,
                    lifecycle: entry.lifecycle,
                }
            })
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ---------------- passes ----------------

pub(crate) struct PassEntry {
    pub(crate) pass: Box<dyn CommandPass>,
    pub(crate) lifecycle: Lifecycle,
}

#[derive(Default)]
pub struct Passes {
    entries: SlotMap<PassId, PassEntry>,
    order: Vec<PassId>,
}

impl Passes {
    pub(crate) fn insert(&mut self, pass: Box<dyn CommandPass>) -> PassId {
        let id = self.entries.insert(PassEntry {
            pass,
            lifecycle: Lifecycle::Uninitialized,
        });
        self.order.push(id);
        id
    }

    pub(crate) fn remove(&mut self, id: PassId) -> Option<Box<dyn CommandPass>> {
        self.order.retain(|i| *i != id);
        self.entries.remove(id).map(|e| e.pass)
    }

    #[inline]
    pub(crate) fn entry_mut(&mut self, id: PassId) -> Option<&mut PassEntry> {
        self.entries.get_mut(id)
    }

    pub fn get<T: CommandPass>(&self, id: PassId) -> Option<&T> {
        self.entries.get(id)?.pass.as_ref().as_any().downcast_ref::<T>()
    }

    pub fn get_mut<T: CommandPass>(&mut self, id: PassId) -> Option<&mut T> {
        self.entries.get_mut(id)?.pass.as_mut().as_any_mut().downcast_mut::<T>()
    }

    pub fn lifecycle(&self, id: PassId) -> Option<Lifecycle> {
        self.entries.get(id).map(|e| e.lifecycle)
    }

    pub fn dependencies(&self, id: PassId) -> Option<StateDep> {
        self.entries.get(id).map(|e| e.pass.dependencies() | StateDep::DEVICE)
    }

    #[inline]
    pub fn ids(&self) -> &[PassId] {
        &self.order
    }

    pub fn infos(&self) -> Vec<EntryInfo<PassId>> {
        self.order
            .iter()
            .map(|id| {
                let entry = &self.entries[*id];
                EntryInfo {
                    id: *id,
                    name: entry.pass.name().to_string(),
                    dependencies: entry.pass.dependencies() | StateDep::DEVICE,
                    lifecycle: entry.lifecycle,
                }
            })
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
