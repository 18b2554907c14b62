use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use tracing::debug;

/// A value accepted by [`QueryFilters::from_pairs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
	Str(String),
	List(Vec<String>),
}

impl From<&str> for FilterValue {
	fn from(value: &str) -> Self {
		Self::Str(String::from(value))
	}
}

impl<const N: usize> From<[&str; N]> for FilterValue {
	fn from(values: [&str; N]) -> Self {
		Self::List(values.iter().map(|value| String::from(*value)).collect())
	}
}

/// The closed set of attribute filters a query supports.
///
/// Filters apply at the study level of a C-FIND identifier, except for the
/// series description which only takes effect on series-level queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilters {
	/// Wildcarded patient-name match.
	pub name: Option<String>,
	/// Wildcarded patient-ID match.
	pub id: Option<String>,
	/// Wildcarded accession-number match.
	pub accession_number: Option<String>,
	/// Wildcarded study-description match.
	pub study_description: Option<String>,
	/// Wildcarded series-description match, applied at series level.
	pub series_description: Option<String>,
	/// Modalities joined with `\` into a ModalitiesInStudy match.
	pub modalities: Vec<String>,
	/// Start of a StudyDate range; only effective together with `end_date`.
	pub start_date: Option<String>,
	/// End of a StudyDate range; only effective together with `start_date`.
	pub end_date: Option<String>,
}

impl QueryFilters {
	/// Builds a filter set from loosely-typed key/value pairs, the form UI
	/// search forms naturally produce. Unknown keys are ignored.
	pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
	where
		K: AsRef<str>,
		V: Into<FilterValue>,
	{
		let mut filters = Self::default();
		for (key, value) in pairs {
			match (key.as_ref(), value.into()) {
				("Name", FilterValue::Str(value)) => filters.name = non_empty(value),
				("ID", FilterValue::Str(value)) => filters.id = non_empty(value),
				("AccessionNumber", FilterValue::Str(value)) => {
					filters.accession_number = non_empty(value);
				}
				("Study", FilterValue::Str(value)) => filters.study_description = non_empty(value),
				("Series", FilterValue::Str(value)) => filters.series_description = non_empty(value),
				("Modalities", FilterValue::List(values)) => filters.modalities = values,
				("StartDate", FilterValue::Str(value)) => filters.start_date = non_empty(value),
				("EndDate", FilterValue::Str(value)) => filters.end_date = non_empty(value),
				(key, _) => debug!("Ignoring unknown search key: {key}"),
			}
		}
		filters
	}

	/// Writes the study-level match keys into a C-FIND identifier,
	/// overwriting the empty return keys inserted before.
	pub fn apply_to(&self, identifier: &mut InMemDicomObject) {
		if let Some(name) = &self.name {
			identifier.put_str(tags::PATIENT_NAME, VR::PN, wildcard(name));
		}
		if let Some(id) = &self.id {
			identifier.put_str(tags::PATIENT_ID, VR::LO, wildcard(id));
		}
		if let Some(accession_number) = &self.accession_number {
			identifier.put_str(tags::ACCESSION_NUMBER, VR::SH, wildcard(accession_number));
		}
		if let Some(description) = &self.study_description {
			identifier.put_str(tags::STUDY_DESCRIPTION, VR::LO, wildcard(description));
		}
		if !self.modalities.is_empty() {
			// An "OR" of modalities, dicom-style: CT\MR
			identifier.put_str(tags::MODALITIES_IN_STUDY, VR::CS, self.modalities.join("\\"));
		}
		if let (Some(start), Some(end)) = (&self.start_date, &self.end_date) {
			let range = format!("{start}-{end}");
			debug!("Query on study date {range}");
			identifier.put_str(tags::STUDY_DATE, VR::DA, range);
		}
	}

	/// The wildcarded series-description match, for series-level identifiers.
	pub fn series_description_wildcard(&self) -> Option<String> {
		self.series_description.as_deref().map(wildcard)
	}

	pub fn is_empty(&self) -> bool {
		self == &Self::default()
	}
}

fn wildcard(value: &str) -> String {
	format!("*{value}*")
}

fn non_empty(value: String) -> Option<String> {
	if value.is_empty() {
		None
	} else {
		Some(value)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::object::mem::InMemElement;

	fn value_of(identifier: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
		identifier
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| value.to_string())
	}

	#[test]
	fn modalities_join_with_backslash() {
		let filters = QueryFilters::from_pairs([("Modalities", ["CT", "MR"])]);
		let mut identifier = InMemDicomObject::new_empty();
		filters.apply_to(&mut identifier);

		assert_eq!(
			value_of(&identifier, tags::MODALITIES_IN_STUDY),
			Some(String::from("CT\\MR"))
		);
	}

	#[test]
	fn date_range_requires_both_ends() {
		let filters = QueryFilters::from_pairs([("StartDate", "20240101"), ("EndDate", "20240131")]);
		let mut identifier = InMemDicomObject::new_empty();
		filters.apply_to(&mut identifier);
		assert_eq!(
			value_of(&identifier, tags::STUDY_DATE),
			Some(String::from("20240101-20240131"))
		);

		let open_ended = QueryFilters::from_pairs([("StartDate", "20240101")]);
		let mut identifier = InMemDicomObject::new_empty();
		open_ended.apply_to(&mut identifier);
		assert_eq!(value_of(&identifier, tags::STUDY_DATE), None);
	}

	#[test]
	fn string_matches_are_wildcarded() {
		let filters = QueryFilters::from_pairs([("Name", "DOE"), ("Study", "Head")]);
		let mut identifier = InMemDicomObject::new_empty();
		filters.apply_to(&mut identifier);

		assert_eq!(
			value_of(&identifier, tags::PATIENT_NAME),
			Some(String::from("*DOE*"))
		);
		assert_eq!(
			value_of(&identifier, tags::STUDY_DESCRIPTION),
			Some(String::from("*Head*"))
		);
	}

	#[test]
	fn unknown_keys_are_ignored() {
		let filters = QueryFilters::from_pairs([("Nonsense", "value")]);
		assert!(filters.is_empty());
	}

	#[test]
	fn series_description_stays_out_of_study_identifier() {
		let filters = QueryFilters::from_pairs([("Series", "loc")]);
		let mut identifier = InMemDicomObject::new_empty();
		filters.apply_to(&mut identifier);

		assert!(identifier.get(tags::SERIES_DESCRIPTION).is_none());
		assert_eq!(
			filters.series_description_wildcard(),
			Some(String::from("*loc*"))
		);
	}

	#[test]
	fn empty_values_do_not_filter() {
		let filters = QueryFilters::from_pairs([("Name", ""), ("ID", "")]);
		assert!(filters.is_empty());
	}
}
